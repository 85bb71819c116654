#![cfg_attr(doc, warn(missing_docs))]
#![doc = include_str!("../README.md")]

pub mod asm;
pub mod emu;
pub mod plat;
