//! Filesystem setup for container working trees.
//!
//! Bind mounts are real `mount(2)` binds when the server may mount, and
//! symlinks otherwise.

pub mod bind;
