use crate::error::{GartError, GartResult};
use crate::gart::{Key, MemoryBlock};
use bitflags::bitflags;
use std::collections::HashMap;

/// Process identity as seen by the control plane. Values are already
/// validated by the surrounding environment; this layer only compares them.
pub type Pid = u32;

bitflags! {
    /// Access rights a client may request for an aperture sub-range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// The host's native mmap protection representation.
    #[must_use]
    pub fn to_native(self) -> libc::c_int {
        let mut native = libc::PROT_NONE;
        if self.contains(Self::READ) {
            native |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            native |= libc::PROT_EXEC;
        }
        native
    }
}

/// One aperture sub-range a client is allowed to map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pg_start: usize,
    pg_count: usize,
    prot: Protection,
    native_prot: libc::c_int,
}

impl Segment {
    /// Validates the reservation shape and converts the protection into
    /// its native form up front.
    #[must_use]
    pub fn new(pg_start: usize, pg_count: usize, prot: Protection) -> Self {
        Self {
            pg_start,
            pg_count,
            prot,
            native_prot: prot.to_native(),
        }
    }

    #[must_use]
    pub fn pg_start(&self) -> usize {
        self.pg_start
    }

    #[must_use]
    pub fn pg_count(&self) -> usize {
        self.pg_count
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.prot
    }

    #[must_use]
    pub fn native_protection(&self) -> libc::c_int {
        self.native_prot
    }
}

/// A process authorized by the current controller to map aperture
/// sub-ranges.
#[derive(Debug)]
pub struct Client {
    pid: Pid,
    authorized: bool,
    segments: Vec<Segment>,
}

impl Client {
    fn new(pid: Pid, authorized: bool, segments: Vec<Segment>) -> Self {
        Self {
            pid,
            authorized,
            segments,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Looks up a reservation by exact (start, count, protection) match.
    /// A request covering a strict subset of a reserved segment does NOT
    /// match; containment is deliberately not honored.
    #[must_use]
    pub fn find_segment(
        &self,
        pg_start: usize,
        pg_count: usize,
        prot: Protection,
    ) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.pg_start == pg_start && s.pg_count == pg_count && s.prot == prot)
    }
}

/// The process holding (or last holding) exclusive hardware access,
/// together with everything it owns: its clients and its allocated blocks.
#[derive(Debug, Default)]
pub struct Controller {
    clients: HashMap<Pid, Client>,
    pool: HashMap<Key, MemoryBlock>,
}

impl Controller {
    #[must_use]
    pub fn client(&self, pid: Pid) -> Option<&Client> {
        self.clients.get(&pid)
    }

    pub(crate) fn insert_block(&mut self, block: MemoryBlock) {
        self.pool.insert(block.key(), block);
    }

    pub(crate) fn remove_block(&mut self, key: Key) -> Option<MemoryBlock> {
        self.pool.remove(&key)
    }

    pub(crate) fn block_mut(&mut self, key: Key) -> Option<&mut MemoryBlock> {
        self.pool.get_mut(&key)
    }

    pub(crate) fn drain_pool(&mut self) -> Vec<MemoryBlock> {
        self.pool.drain().map(|(_, block)| block).collect()
    }

    fn set_clients_authorized(&mut self, authorized: bool) {
        for client in self.clients.values_mut() {
            client.authorized = authorized;
        }
    }
}

/// Controller/client bookkeeping: who holds the hardware, who may map what.
///
/// At most one controller is current system-wide; that is the single global
/// ownership invariant this structure protects. Dropping hardware ownership
/// (`clear_current`) and destroying a controller's records (`remove_controller`)
/// are deliberately separate steps.
#[derive(Debug)]
pub struct Sessions {
    controllers: HashMap<Pid, Controller>,
    current: Option<Pid>,
    max_segments: usize,
}

impl Sessions {
    #[must_use]
    pub fn new(max_segments: usize) -> Self {
        Self {
            controllers: HashMap::new(),
            current: None,
            max_segments,
        }
    }

    #[must_use]
    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    /// `NotOwner` unless `pid` is the current controller.
    pub fn ensure_current(&self, pid: Pid) -> GartResult<()> {
        if self.current == Some(pid) {
            Ok(())
        } else {
            Err(GartError::NotOwner)
        }
    }

    /// Makes `pid` the current controller, creating or reusing its record,
    /// and authorizes every client it had registered.
    pub fn make_current(&mut self, pid: Pid) {
        let controller = self.controllers.entry(pid).or_default();
        controller.set_clients_authorized(true);
        self.current = Some(pid);
    }

    /// Drops hardware ownership. The controller record, its pool and its
    /// clients all survive; only the clients' authorization is revoked.
    ///
    /// # Errors
    /// `NotOwner` if `pid` is not the current controller.
    pub fn clear_current(&mut self, pid: Pid) -> GartResult<()> {
        self.ensure_current(pid)?;
        if let Some(controller) = self.controllers.get_mut(&pid) {
            controller.set_clients_authorized(false);
        }
        self.current = None;
        Ok(())
    }

    /// Removes a controller record entirely, handing its pool back to the
    /// caller for freeing. `None` if `pid` never controlled anything.
    pub fn remove_controller(&mut self, pid: Pid) -> Option<Controller> {
        if self.current == Some(pid) {
            self.current = None;
        }
        self.controllers.remove(&pid)
    }

    /// Removes every client record registered for `pid`, under any
    /// controller.
    pub fn remove_client_records(&mut self, pid: Pid) {
        for controller in self.controllers.values_mut() {
            controller.clients.remove(&pid);
        }
    }

    #[must_use]
    pub fn controller(&self, pid: Pid) -> Option<&Controller> {
        self.controllers.get(&pid)
    }

    /// Pids of every controller record, current or idle.
    #[must_use]
    pub fn controller_pids(&self) -> Vec<Pid> {
        self.controllers.keys().copied().collect()
    }

    pub(crate) fn controller_mut(&mut self, pid: Pid) -> Option<&mut Controller> {
        self.controllers.get_mut(&pid)
    }

    /// Replaces (or removes) the segment reservation for `client_pid`
    /// under the current controller.
    ///
    /// An empty segment list removes the client record; this is idempotent.
    /// Otherwise the old list is replaced wholesale and the client is
    /// authorized, since its owning controller is necessarily current.
    ///
    /// # Errors
    /// `NotOwner` if `controller_pid` is not current, `TooManySegments`
    /// over the configured cap.
    pub fn reserve(
        &mut self,
        controller_pid: Pid,
        client_pid: Pid,
        segments: Vec<Segment>,
    ) -> GartResult<()> {
        self.ensure_current(controller_pid)?;
        let Some(controller) = self.controllers.get_mut(&controller_pid) else {
            return Err(GartError::NotOwner);
        };

        if segments.is_empty() {
            controller.clients.remove(&client_pid);
            return Ok(());
        }
        if segments.len() > self.max_segments {
            return Err(GartError::TooManySegments);
        }

        controller
            .clients
            .insert(client_pid, Client::new(client_pid, true, segments));
        Ok(())
    }

    /// Resolves an mmap authorization request for a client of the current
    /// controller: the client must exist and be authorized, and the
    /// requested range must match a reservation exactly.
    ///
    /// # Errors
    /// `PermissionDenied` for unknown or deauthorized clients, `NotFound`
    /// when no reservation matches exactly.
    pub fn find_segment(
        &self,
        client_pid: Pid,
        pg_start: usize,
        pg_count: usize,
        prot: Protection,
    ) -> GartResult<&Segment> {
        let client = self
            .current
            .and_then(|pid| self.controllers.get(&pid))
            .and_then(|controller| controller.client(client_pid))
            .filter(|client| client.is_authorized())
            .ok_or(GartError::PermissionDenied)?;

        client
            .find_segment(pg_start, pg_count, prot)
            .ok_or(GartError::NotFound)
    }
}
