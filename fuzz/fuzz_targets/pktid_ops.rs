/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pcie_msgbuf::dma::DmaDir;
use pcie_msgbuf::pktid::{BufClass, PktIdMap};

#[derive(Arbitrary, Debug)]
enum Op {
    Alloc { class: BufClass, pa: u64, len: u32, dir: DmaDir },
    Reserve(BufClass),
    /// Release whatever id the device names, valid or not.
    Release { id: u32, class: BufClass },
    /// Release the `n`th live id with its own class.
    ReleaseLive(u8),
    Drain,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    capacity: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: FuzzInput| {
    let mut map = PktIdMap::new(input.capacity as u32);
    // id -> (packet tag, class)
    let mut model: BTreeMap<u32, (u64, BufClass)> = BTreeMap::new();
    let mut tag = 0u64;

    for op in input.ops {
        match op {
            Op::Alloc { class, pa, len, dir } => {
                tag += 1;
                match map.alloc(tag, pa, len, dir, class) {
                    Ok(id) => assert!(model.insert(id.raw(), (tag, class)).is_none()),
                    Err(e) => {
                        assert_eq!(e.0, tag);
                        assert_eq!(model.len(), map.capacity() as usize);
                    }
                }
            }
            Op::Reserve(class) => {
                tag += 1;
                if let Ok(id) = map.reserve(tag, class) {
                    assert!(model.insert(id.raw(), (tag, class)).is_none());
                }
            }
            Op::Release { id, class } => {
                let res = map.release(id, class);
                match model.get(&id) {
                    Some(&(t, stored)) if class == BufClass::Unchecked || class == stored => {
                        assert_eq!(res.map(|r| r.pkt).ok(), Some(t));
                        model.remove(&id);
                    }
                    _ => assert!(res.is_err()),
                }
            }
            Op::ReleaseLive(n) => {
                if model.is_empty() {
                    continue;
                }
                let id = *model.keys().nth(n as usize % model.len()).unwrap();
                let (t, class) = model.remove(&id).unwrap();
                assert_eq!(map.release(id, class).map(|r| r.pkt).ok(), Some(t));
            }
            Op::Drain => {
                let mut drained: Vec<u64> = map.drain().into_iter().map(|r| r.pkt).collect();
                drained.sort_unstable();
                let mut expected: Vec<u64> = model.values().map(|(t, _)| *t).collect();
                expected.sort_unstable();
                assert_eq!(drained, expected);
                model.clear();
            }
        }
        assert_eq!(map.in_use(), model.len());
        assert_eq!(map.audit_failures(), 0);
    }
});
