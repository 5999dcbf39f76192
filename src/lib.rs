// TODO(canopen): enable "#![no_std]" for hosted targets too once the EDS
// loader stops depending on std::collections.
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]

extern crate alloc;

pub mod data_type;
pub mod emergency;
pub mod error;
pub mod message;
pub mod nmt;
pub mod node;
pub mod object_dictionary;
pub mod pdo;
pub mod sdo_client;
pub mod sdo_server;
pub mod timers;
pub mod util;
pub mod value;

mod cmd_header;
mod prelude;
