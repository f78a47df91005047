//! The control-plane surface.
//!
//! [`GartDevice`] is what a character-device front-end (or a test) talks
//! to. Every operation takes one global mutex for its whole duration; the
//! serialization that lock provides is part of the contract: at most one
//! current controller, and no pool is ever mutated by two callers at once.

use crate::backend::{AgpMode, HardwareBackend, MemoryType};
use crate::config::GartConfig;
use crate::error::{GartError, GartResult};
use crate::gart::{GartInfo, GartManager, Key};
use log::debug;
use std::sync::{Mutex, MutexGuard};

pub mod session;

use session::{Pid, Protection, Segment, Sessions};

/// What an Allocate request hands back to the caller.
///
/// `physical` is meaningful to vendor-type consumers (it addresses the
/// first page); generic callers only need the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBlock {
    pub key: Key,
    pub page_count: usize,
    pub physical: u64,
}

struct GartState {
    manager: GartManager,
    sessions: Sessions,
}

/// One GART device instance: the generic engine plus session bookkeeping
/// behind a single coarse lock.
pub struct GartDevice {
    state: Mutex<GartState>,
}

impl GartDevice {
    /// Brings the device up on the given chipset backend.
    ///
    /// # Errors
    /// `NoMemoryForTable` or `BackendConfigureFailed`, both fatal: no
    /// controller can ever be acquired on a device that failed bring-up.
    pub fn new(backend: Box<dyn HardwareBackend>, config: GartConfig) -> GartResult<Self> {
        let manager = GartManager::bring_up(backend, &config)?;
        Ok(Self {
            state: Mutex::new(GartState {
                manager,
                sessions: Sessions::new(config.max_segments),
            }),
        })
    }

    // Control-plane lock. Poisoning only happens if a caller panicked
    // mid-operation, at which point the bookkeeping is unreliable anyway.
    fn lock(&self) -> MutexGuard<'_, GartState> {
        self.state.lock().unwrap()
    }

    /// Snapshot of version, aperture geometry, mode and page accounting.
    #[must_use]
    pub fn info(&self) -> GartInfo {
        self.lock().manager.info()
    }

    /// Makes `pid` the controller, granting exclusive hardware access.
    ///
    /// # Errors
    /// `PermissionDenied` without elevated privilege, `Busy` while any
    /// controller (or an out-of-band owner in the backend) holds the
    /// hardware.
    pub fn acquire(&self, pid: Pid, privileged: bool) -> GartResult<()> {
        let mut state = self.lock();
        if !privileged {
            return Err(GartError::PermissionDenied);
        }
        if state.sessions.current_pid().is_some() {
            return Err(GartError::Busy);
        }
        state.manager.acquire_hw()?;
        state.sessions.make_current(pid);
        debug!("controller acquired by pid {pid}");
        Ok(())
    }

    /// Drops `pid`'s exclusive hardware access.
    ///
    /// The controller's bookkeeping survives: its pool and client records
    /// stay intact (clients lose authorization) until [`Self::detach`].
    ///
    /// # Errors
    /// `NotOwner` if `pid` is not the current controller.
    pub fn release(&self, pid: Pid) -> GartResult<()> {
        let mut state = self.lock();
        state.sessions.clear_current(pid)?;
        state.manager.release_hw();
        debug!("controller released by pid {pid}");
        Ok(())
    }

    /// Final teardown for `pid`, the analog of its descriptor closing:
    /// releases the hardware if `pid` still holds it, destroys its
    /// controller record with every client and block it owns, and removes
    /// any client records `pid` registered under other controllers.
    pub fn detach(&self, pid: Pid) {
        let mut state = self.lock();
        if state.sessions.current_pid() == Some(pid) {
            let _ = state.sessions.clear_current(pid);
            state.manager.release_hw();
        }
        if let Some(mut controller) = state.sessions.remove_controller(pid) {
            for block in controller.drain_pool() {
                state.manager.free_memory(block);
            }
        }
        state.sessions.remove_client_records(pid);
        debug!("pid {pid} detached");
    }

    /// Negotiates and enables the requested AGP mode.
    ///
    /// # Errors
    /// `NotOwner` if `pid` is not the current controller.
    pub fn setup(&self, pid: Pid, requested: AgpMode) -> GartResult<()> {
        let mut state = self.lock();
        state.sessions.ensure_current(pid)?;
        let command = state.manager.enable(requested);
        debug!("mode enabled: {command:?}");
        Ok(())
    }

    /// Replaces (or, with an empty list, removes) `client_pid`'s segment
    /// reservation.
    ///
    /// # Errors
    /// `NotOwner` unless `pid` is the current controller,
    /// `TooManySegments` over the configured cap.
    pub fn reserve(&self, pid: Pid, client_pid: Pid, segments: Vec<Segment>) -> GartResult<()> {
        self.lock().sessions.reserve(pid, client_pid, segments)
    }

    /// Allocates `page_count` pages of `mem_type` memory into the current
    /// controller's pool.
    ///
    /// # Errors
    /// `NotOwner` unless `pid` is the current controller; `OutOfMemory`,
    /// `Exhausted` or `TypeMismatch` from the engine. Allocation failures
    /// are fully rolled back, never partial.
    pub fn allocate(
        &self,
        pid: Pid,
        page_count: usize,
        mem_type: MemoryType,
    ) -> GartResult<AllocatedBlock> {
        let mut state = self.lock();
        state.sessions.ensure_current(pid)?;

        let block = state.manager.allocate_memory(page_count, mem_type)?;
        let handle = AllocatedBlock {
            key: block.key(),
            page_count: block.page_count(),
            physical: block.physical(),
        };

        let GartState { sessions, .. } = &mut *state;
        if let Some(controller) = sessions.controller_mut(pid) {
            controller.insert_block(block);
        }
        Ok(handle)
    }

    /// Frees the allocation identified by `key`, unbinding it first if it
    /// is still bound.
    ///
    /// # Errors
    /// `NotOwner` unless `pid` is the current controller, `InvalidKey` if
    /// the key does not resolve to a live block in its pool.
    pub fn deallocate(&self, pid: Pid, key: Key) -> GartResult<()> {
        let mut state = self.lock();
        state.sessions.ensure_current(pid)?;

        let GartState { manager, sessions } = &mut *state;
        let block = sessions
            .controller_mut(pid)
            .and_then(|controller| controller.remove_block(key))
            .ok_or(GartError::InvalidKey(key))?;
        manager.free_memory(block);
        Ok(())
    }

    /// Binds the allocation identified by `key` at aperture page
    /// `pg_start`.
    ///
    /// # Errors
    /// `NotOwner`, `InvalidKey`, or the bind-time policy failures:
    /// `InvalidRange`, `Occupied`, `TypeMismatch`.
    pub fn bind(&self, pid: Pid, key: Key, pg_start: usize) -> GartResult<()> {
        let mut state = self.lock();
        state.sessions.ensure_current(pid)?;

        let GartState { manager, sessions } = &mut *state;
        let block = sessions
            .controller_mut(pid)
            .and_then(|controller| controller.block_mut(key))
            .ok_or(GartError::InvalidKey(key))?;
        manager.bind_memory(block, pg_start)
    }

    /// Unbinds the allocation identified by `key`.
    ///
    /// # Errors
    /// `NotOwner`, `InvalidKey`, or `NotBound`.
    pub fn unbind(&self, pid: Pid, key: Key) -> GartResult<()> {
        let mut state = self.lock();
        state.sessions.ensure_current(pid)?;

        let GartState { manager, sessions } = &mut *state;
        let block = sessions
            .controller_mut(pid)
            .and_then(|controller| controller.block_mut(key))
            .ok_or(GartError::InvalidKey(key))?;
        manager.unbind_memory(block)
    }

    /// Authorizes an mmap request, returning the native protection bits
    /// for the mapping layer to apply. The current controller may map any
    /// in-range span of the aperture; clients need an exact segment match.
    ///
    /// # Errors
    /// `InvalidRange` for a controller request outside the usable
    /// aperture, `PermissionDenied` for unknown/deauthorized clients,
    /// `NotFound` when no reservation matches exactly.
    pub fn authorize_mmap(
        &self,
        pid: Pid,
        pg_start: usize,
        pg_count: usize,
        prot: Protection,
    ) -> GartResult<libc::c_int> {
        let state = self.lock();

        if state.sessions.current_pid() == Some(pid) {
            let info = state.manager.info();
            let usable_pages = (info.aperture_size_mb as usize) << 8;
            let end = pg_start
                .checked_add(pg_count)
                .ok_or(GartError::InvalidRange)?;
            if end > usable_pages {
                return Err(GartError::InvalidRange);
            }
            return Ok(prot.to_native());
        }

        state
            .sessions
            .find_segment(pid, pg_start, pg_count, prot)
            .map(Segment::native_protection)
    }

    /// Saves hardware state ahead of a power transition.
    ///
    /// # Errors
    /// Propagates backend save-state failures.
    pub fn suspend(&self) -> GartResult<()> {
        self.lock().manager.suspend()
    }

    /// Restores hardware state after a power transition.
    pub fn resume(&self) {
        self.lock().manager.resume();
    }

    /// Tears the whole device down: every controller is detached (freeing
    /// its pool), then the table and scratch page are released in reverse
    /// bring-up order.
    pub fn shut_down(self) {
        let state = self.state.into_inner().unwrap();
        let GartState {
            mut manager,
            mut sessions,
        } = state;

        if let Some(pid) = sessions.current_pid() {
            let _ = sessions.clear_current(pid);
            manager.release_hw();
        }
        for pid in sessions.controller_pids() {
            if let Some(mut controller) = sessions.remove_controller(pid) {
                for block in controller.drain_pool() {
                    manager.free_memory(block);
                }
            }
        }
        manager.tear_down();
    }
}
