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

//! Helpers for testing the pcie-msgbuf protocol crates.

/// A `log::Log` implementation that records every call made by the
/// protocol crate so tests can assert on what was logged.
pub mod simplelogger;

/// Log target prefix recorded by [`simplelogger::SimpleLogger`].
pub const MSGBUF_LOG_TARGET: &str = "pcie_msgbuf";
