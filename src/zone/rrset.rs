/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Grouping of flat record lists into canonically ordered RRsets.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use hickory_proto::rr::{DNSClass, LowerName, Record, RecordSet, RecordType};

/// Groups `records` into RRsets by (owner, class, type), preserving
/// first-seen order within each set, then orders the sets by owner name,
/// class, and type. A TTL disagreeing within a set is normalized to the
/// set's first-seen TTL, so one (owner, type) never splits into sets the
/// zone index cannot reach. An SOA set always sorts first regardless of
/// its type value, since zone-shaped consumers expect it to lead.
pub fn group_records(records: Vec<Record>) -> Vec<RecordSet> {
    let mut sets: Vec<RecordSet> = Vec::new();
    let mut index: HashMap<(LowerName, DNSClass, RecordType), usize> = HashMap::new();

    for mut record in records {
        let key = (
            LowerName::new(record.name()),
            record.dns_class(),
            record.record_type(),
        );
        match index.entry(key) {
            Entry::Occupied(entry) => {
                let set = &mut sets[*entry.get()];
                if record.ttl() != set.ttl() {
                    record.set_ttl(set.ttl());
                }
                set.insert(record, 0);
            }
            Entry::Vacant(entry) => {
                let mut set =
                    RecordSet::with_ttl(record.name().clone(), record.record_type(), record.ttl());
                set.set_dns_class(record.dns_class());
                set.insert(record, 0);
                entry.insert(sets.len());
                sets.push(set);
            }
        }
    }

    sets.sort_by(|a, b| sort_rank(a).cmp(&sort_rank(b)));
    sets
}

fn sort_rank(set: &RecordSet) -> (bool, LowerName, u16, RecordType) {
    (
        set.record_type() != RecordType::SOA,
        LowerName::new(set.name()),
        u16::from(set.dns_class()),
        set.record_type(),
    )
}
