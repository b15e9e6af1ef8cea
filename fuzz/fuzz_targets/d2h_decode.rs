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

use libfuzzer_sys::fuzz_target;
use pcie_msgbuf::dispatch::{D2hMsg, DispatchError};
use pcie_msgbuf::wire::{MsgType, RxCmplt};

// Slot contents come straight from device memory; decoding must never
// panic, whatever the type byte and however short the slot.
fuzz_target!(|data: &[u8]| {
    let Some((&msg_type, rest)) = data.split_first() else {
        return;
    };
    let slot = &rest[..rest.len().min(RxCmplt::SIZE)];

    match D2hMsg::decode(msg_type, slot) {
        Ok(_) => assert!((msg_type as usize) < MsgType::TABLE_LEN),
        Err(DispatchError::UnknownType(t)) => assert_eq!(t, msg_type),
        Err(DispatchError::Truncated { len, needed, .. }) => assert!(len < needed),
    }
});
