//! Host-side builders: batch tools that turn compiled ELF objects into the two file kinds the
//! device-side loader consumes.
//!
//! * [`module_builder`] drives [`crate::reader`] over an application ELF object to produce a
//!   program module file (`mkminimod`).
//! * [`symtab_builder`] drives [`crate::reader`] over a kernel ELF object to produce a kernel
//!   symbol table file (`mksymtab`).
//!
//! Both builders share the same two-pass CRC backpatching and EOF-sentinel protocol from
//! [`crate::format`].

pub mod module_builder;
pub mod symtab_builder;
