//! Supervision of one process's faults by another.
//!
//! A process that wants to be monitored connects a [`Client`] to a [`Server`]
//! running in a different process. During registration the server verifies
//! the client's identity from the socket's credentials, creates a pair of
//! event descriptors, and transfers the pair back over the socket, after
//! which both processes hold them for the lifetime of the client.
//!
//! Once registered, the client installs handlers for the fatal signal set
//! (`SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL`, `SIGSEGV`, `SIGTRAP`). When one
//! of those signals is raised the handler records the fault in a block of
//! memory the server was told about at registration, signals the first event,
//! and blocks on the second. The server observes the first event, captures
//! whatever it wants from the stopped process via its [`ServerHandler`], then
//! signals the second event so the client can continue to its death.
//!
//! The server also watches every registered process directly, so clients that
//! exit without faulting, cleanly or killed outright, are unregistered with
//! no action on their part. A client that faults before the server has
//! finished processing its registration is still caught: the event
//! descriptors stay readable once signaled, so the fault is observed as soon
//! as the registration is applied.
//!
//! Only Linux and Android are supported.

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:

mod errors;

pub use errors::Error;

use std::os::fd::BorrowedFd;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
#[allow(unsafe_code)]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod client;
        mod events;
        mod fault;
        mod ipc;
        mod server;
        mod sys;

        pub use client::{Client, ClientOptions, MonitorStatus, Registration};
        pub use fault::FaultBlock;
        pub use ipc::{RegistrationAck, RegistrationRequest, SocketName, RESERVED_PID_FLOOR};
        pub use server::{Server, ServerOptions};
    } else {
        compile_error!("crash-warden only supports Linux and Android");
    }
}

/// Details of one registered client, handed to [`ServerHandler::capture_dump`]
/// while the faulted process is stopped on the rendezvous.
pub struct ClientInfo<'scope> {
    /// Process id the client registered with, verified against the socket's
    /// credentials.
    pub process_id: u32,
    /// The thread that performed the registration.
    pub thread_id: u32,
    /// Address of the client's fault block, in the client's address space.
    /// When the client is stopped on a fault this points at the filled in
    /// [`FaultBlock`] and can be read with eg. `process_vm_readv`.
    pub fault_context: u64,
    /// Handle on the client process itself. Stays valid for the duration of
    /// the callback even if the process dies during it.
    pub process_handle: BorrowedFd<'scope>,
}

/// Tells the message loop whether to keep going after a handler callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopAction {
    /// Keep processing messages.
    Continue,
    /// Exit the message loop.
    Exit,
}

/// Allows user code to hook into the server to avoid hardcoding too many details
pub trait ServerHandler: Send + Sync {
    /// Called while a faulted client is stopped on the rendezvous, with the
    /// information needed to read its state.
    ///
    /// The dump-done event is signaled when this returns, regardless of the
    /// result, so the faulted process never stays blocked on the outcome.
    fn capture_dump(&self, client: &ClientInfo<'_>) -> Result<(), std::io::Error>;

    /// Called after each registration with the number of live clients.
    fn on_client_registered(&self, num_clients: usize) -> LoopAction {
        let _ = num_clients;
        LoopAction::Continue
    }

    /// Called after each teardown with the number of remaining clients.
    ///
    /// Returning [`LoopAction::Exit`] when the count reaches zero is the
    /// usual way for a supervisor to end its run once every monitored
    /// process is gone.
    fn on_client_unregistered(&self, num_clients: usize) -> LoopAction {
        let _ = num_clients;
        LoopAction::Continue
    }
}
