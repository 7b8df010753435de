// SPDX-License-Identifier: Apache-2.0

pub mod console;
pub mod file_table;
