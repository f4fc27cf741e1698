//! Ferrum OS kernel - IPC resource layer
//!
//! System V style inter-process communication for a small monolithic
//! kernel: message queues, semaphore sets and shared memory segments.
//! This crate owns the resource tables and the message transfer protocol;
//! the scheduler's suspend/wake primitive, the virtual-memory mapper and
//! the semaphore wait/signal algorithm are reached through the port traits
//! in [`sched`], [`ipc::shm`] and [`ipc::sem`].
//!
//! The embedding kernel installs a global allocator and a `log` sink, then
//! calls [`ipc::init`] with its collaborator ports during boot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ipc;
pub mod sched;
pub mod time;
pub mod util;
