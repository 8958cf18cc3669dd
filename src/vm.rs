//! Public API surface (spec §6): VM and PE lifecycle, port/socket wiring, the
//! push/pull application interface, and exchange-buffer checkout.
//!
//! This is a safe Rust surface over the same operations the original exposes as an
//! `extern "C"` table with a caller-allocated 256-byte error buffer per call; callers
//! here get a `Result<_, NetVmError>` instead, and [`write_error`] is kept around for
//! any embedder that still wants to render one into a fixed buffer.

use std::collections::HashMap;

use crate::compile::{compile_segment, CompileOptions};
use crate::container::{self, ContainerError, Image};
use crate::coprocessors::CoprocessorTable;
use crate::error::NetVmError;
use crate::runtime::{ExchangeBuffer, ExchangeBufferPool, HandlerStats, ProcessingElement, SegmentSlot};
use crate::verifier::SegmentKind;

/// Opaque handle identifying a processing element inside a [`NetVm`]. Stable for the
/// element's lifetime; reused after [`NetVm::destroy_pe`] frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeHandle(u32);

/// Opaque handle identifying a host-side socket bound by [`NetVm::bind_physical_interface`]
/// or created by [`NetVm::connect_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(u32);

/// One end of a port connection: a PE's named input or output port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub pe: PeHandle,
    pub port: String,
}

/// A physical interface the host makes available for binding (spec §6's "enumerate
/// physical interfaces"). Enumeration of the actual host network devices is out of
/// scope (spec §1); the host registers the interfaces it wants visible.
#[derive(Debug, Clone)]
pub struct PhysicalInterface {
    pub name: String,
}

enum Connection {
    Port { from: PortRef, to: PortRef },
    Socket { socket: SocketHandle, port: PortRef },
}

/// The top-level VM: owns every processing element, the port/socket wiring between
/// them, the registered physical interfaces, and a shared exchange-buffer pool.
pub struct NetVm {
    pes: HashMap<u32, ProcessingElement>,
    next_pe_id: u32,
    connections: Vec<Connection>,
    interfaces: Vec<PhysicalInterface>,
    socket_bindings: HashMap<SocketHandle, String>,
    next_socket_id: u32,
    buffers: ExchangeBufferPool,
}

impl NetVm {
    /// Creates a VM with an exchange-buffer pool sized for `buffer_pool_capacity`
    /// concurrently-outstanding buffers.
    pub fn new(buffer_pool_capacity: usize) -> Self {
        NetVm {
            pes: HashMap::new(),
            next_pe_id: 0,
            connections: Vec::new(),
            interfaces: Vec::new(),
            socket_bindings: HashMap::new(),
            next_socket_id: 0,
            buffers: ExchangeBufferPool::new(buffer_pool_capacity),
        }
    }

    /// Destroys the VM's processing elements and wiring; the VM itself is simply
    /// dropped after this returns (no owned OS resources outlive it).
    pub fn destroy(&mut self) {
        self.pes.clear();
        self.connections.clear();
        self.interfaces.clear();
        self.socket_bindings.clear();
    }

    /// Creates an empty processing element with its own coprocessor table, not yet
    /// carrying any compiled segment.
    pub fn create_pe(&mut self, coprocessors: CoprocessorTable) -> PeHandle {
        let id = self.next_pe_id;
        self.next_pe_id += 1;
        self.pes.insert(id, ProcessingElement::new(coprocessors));
        PeHandle(id)
    }

    /// Removes a processing element and any port/socket connections that reference
    /// it.
    pub fn destroy_pe(&mut self, pe: PeHandle) {
        self.pes.remove(&pe.0);
        self.connections.retain(|c| match c {
            Connection::Port { from, to } => from.pe != pe && to.pe != pe,
            Connection::Socket { port, .. } => port.pe != pe,
        });
    }

    fn pe_mut(&mut self, pe: PeHandle) -> Result<&mut ProcessingElement, NetVmError> {
        self.pes.get_mut(&pe.0).ok_or(NetVmError::UnknownPe)
    }

    fn pe(&self, pe: PeHandle) -> Result<&ProcessingElement, NetVmError> {
        self.pes.get(&pe.0).ok_or(NetVmError::UnknownPe)
    }

    /// Loads a PE image already parsed from memory (spec §6's "load from memory"
    /// variant) onto `pe`, compiling every code section and installing it under its
    /// matching [`SegmentSlot`].
    pub fn load_pe_image(&mut self, pe: PeHandle, image: &Image, options: &CompileOptions) -> Result<(), NetVmError> {
        for (entry, section) in &image.code_sections {
            let kind = if entry.flags.contains(container::SectionFlags::INIT) {
                SegmentKind::Init
            } else if entry.flags.contains(container::SectionFlags::PUSH) {
                SegmentKind::Push
            } else if entry.flags.contains(container::SectionFlags::PULL) {
                SegmentKind::Pull
            } else {
                continue;
            };
            let compiled = compile_segment(&section.code, section.header, kind, options)?;
            let slot = match kind {
                SegmentKind::Init => SegmentSlot::Init,
                SegmentKind::Push => SegmentSlot::Push,
                SegmentKind::Pull => SegmentSlot::Pull,
            };
            self.pe_mut(pe)?.install_segment(slot, compiled);
        }
        Ok(())
    }

    /// Loads a PE image directly from its serialised container bytes (spec §6's
    /// "load from memory" variant, parsing step included). "Load from file" and "load
    /// from assembler output" are the host's responsibility to turn into bytes first
    /// (spec §1).
    pub fn load_pe_bytes(&mut self, pe: PeHandle, data: &[u8], options: &CompileOptions) -> Result<(), NetVmError> {
        let image = container::parse(data).map_err(NetVmError::Container)?;
        self.load_pe_image(pe, &image, options)
    }

    /// Connects `from`'s output port to `to`'s input port.
    pub fn connect_ports(&mut self, from: PortRef, to: PortRef) -> Result<(), NetVmError> {
        self.pe(from.pe)?;
        self.pe(to.pe)?;
        self.connections.push(Connection::Port { from, to });
        Ok(())
    }

    /// Registers a host-visible physical interface that can later be bound to a
    /// socket with [`NetVm::bind_physical_interface`].
    pub fn register_physical_interface(&mut self, name: impl Into<String>) -> PhysicalInterface {
        let interface = PhysicalInterface { name: name.into() };
        self.interfaces.push(interface.clone());
        interface
    }

    /// Lists every physical interface the host has registered.
    pub fn physical_interfaces(&self) -> &[PhysicalInterface] {
        &self.interfaces
    }

    /// Binds a registered physical interface to `port`, allocating a new socket
    /// handle for it.
    pub fn bind_physical_interface(&mut self, interface: &PhysicalInterface, port: PortRef) -> Result<SocketHandle, NetVmError> {
        self.pe(port.pe)?;
        if !self.interfaces.iter().any(|i| i.name == interface.name) {
            return Err(NetVmError::UnknownInterface(interface.name.clone()));
        }
        let socket = SocketHandle(self.next_socket_id);
        self.next_socket_id += 1;
        self.socket_bindings.insert(socket, interface.name.clone());
        self.connections.push(Connection::Socket { socket, port });
        Ok(socket)
    }

    /// Pushes `exbuf` into `pe`'s push application interface, dispatching its
    /// compiled `push` handler.
    pub fn push(&mut self, pe: PeHandle, exbuf: &mut ExchangeBuffer) -> Result<(), NetVmError> {
        self.pe_mut(pe)?.dispatch(SegmentSlot::Push, exbuf).map_err(NetVmError::Runtime)
    }

    /// Pulls through `pe`'s pull application interface, dispatching its compiled
    /// `pull` handler.
    pub fn pull(&mut self, pe: PeHandle, exbuf: &mut ExchangeBuffer) -> Result<(), NetVmError> {
        self.pe_mut(pe)?.dispatch(SegmentSlot::Pull, exbuf).map_err(NetVmError::Runtime)
    }

    /// Runs `pe`'s `init` segment once; callers typically invoke this right after
    /// [`NetVm::load_pe_image`] when [`crate::compile::JitFlags::INIT`] was requested.
    pub fn run_init(&mut self, pe: PeHandle, exbuf: &mut ExchangeBuffer) -> Result<(), NetVmError> {
        self.pe_mut(pe)?.dispatch(SegmentSlot::Init, exbuf).map_err(NetVmError::Runtime)
    }

    /// Direct access to `pe`'s persistent data memory area, the `d*load`/`d*store`
    /// area its compiled handlers address. Lets the host seed or inspect it outside a
    /// dispatch.
    pub fn pe_data_memory_mut(&mut self, pe: PeHandle) -> Result<&mut [u8], NetVmError> {
        Ok(self.pe_mut(pe)?.data_memory_mut())
    }

    /// Direct access to `pe`'s persistent shared/init memory area, the `s*load`/
    /// `s*store` area its compiled handlers address.
    pub fn pe_shared_memory_mut(&mut self, pe: PeHandle) -> Result<&mut [u8], NetVmError> {
        Ok(self.pe_mut(pe)?.shared_memory_mut())
    }

    /// Reads back `pe`'s per-segment invocation statistics.
    pub fn handler_stats(&self, pe: PeHandle, slot: SegmentSlot) -> Result<Option<&HandlerStats>, NetVmError> {
        Ok(self.pe(pe)?.stats(slot))
    }

    /// Accesses `pe`'s coprocessor table, e.g. to `init`/`read`/`write` a named
    /// coprocessor's registers directly (the "read/write application interface"
    /// operation, applied to a coprocessor rather than a port).
    pub fn coprocessors_mut(&mut self, pe: PeHandle) -> Result<&mut CoprocessorTable, NetVmError> {
        Ok(self.pe_mut(pe)?.coprocessors_mut())
    }

    /// Dispatches `op_id` against `pe`'s named coprocessor (the "invoke" half of the
    /// read/write application interface applied to a coprocessor).
    pub fn invoke_coprocessor(&mut self, pe: PeHandle, name: &str, op_id: u32, exbuf: &ExchangeBuffer) -> Result<(), NetVmError> {
        self.pe_mut(pe)?.invoke_coprocessor(name, op_id, exbuf).map_err(NetVmError::Runtime)
    }

    /// Installs a receiver notified with a profiling snapshot after every dispatch on
    /// `pe`.
    #[cfg(feature = "profile-any")]
    pub fn set_profile_receiver(
        &mut self,
        pe: PeHandle,
        receiver: Box<dyn crate::profiler::ProfileReceiver + Send + Sync>,
    ) -> Result<(), NetVmError> {
        self.pe_mut(pe)?.set_profile_receiver(receiver);
        Ok(())
    }

    /// Checks an exchange buffer out of the shared pool.
    pub fn get_exchange_buffer(&mut self) -> Option<ExchangeBuffer> {
        self.buffers.get()
    }

    /// Returns an exchange buffer to the shared pool.
    pub fn release_exchange_buffer(&mut self, buf: ExchangeBuffer) {
        self.buffers.release(buf);
    }
}

impl From<ContainerError> for NetVmError {
    fn from(err: ContainerError) -> Self {
        NetVmError::Container(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{CodeSection, FileHeader, SectionEntry, SectionFlags};
    use crate::verifier::SegmentHeader;

    fn minimal_image() -> Image {
        Image {
            header: FileHeader::default(),
            code_sections: vec![(
                SectionEntry { name: "push".into(), size: 0, file_offset: 0, flags: SectionFlags::CODE | SectionFlags::PUSH },
                CodeSection { header: SegmentHeader { max_stack_size: 1, locals_size: 0 }, code: vec![0x01, 0x06] },
            )],
            port_sections: Vec::new(),
            line_map_sections: Vec::new(),
        }
    }

    #[test]
    fn loading_and_pushing_through_a_minimal_pe_dispatches_its_handler() {
        let mut vm = NetVm::new(4);
        let pe = vm.create_pe(CoprocessorTable::new());
        vm.load_pe_image(pe, &minimal_image(), &CompileOptions::default()).unwrap();

        let mut exbuf = vm.get_exchange_buffer().unwrap();
        vm.push(pe, &mut exbuf).unwrap();
        vm.release_exchange_buffer(exbuf);

        assert_eq!(vm.handler_stats(pe, SegmentSlot::Push).unwrap().unwrap().invocations, 1);
    }

    #[test]
    fn pushing_a_segment_that_writes_data_memory_is_observable_after_dispatch() {
        let mut vm = NetVm::new(4);
        let pe = vm.create_pe(CoprocessorTable::new());
        let image = Image {
            header: FileHeader::default(),
            code_sections: vec![(
                SectionEntry { name: "push".into(), size: 0, file_offset: 0, flags: SectionFlags::CODE | SectionFlags::PUSH },
                // pushbyte 0 (index); pushbyte 99 (value); dbstore; ret
                CodeSection { header: SegmentHeader { max_stack_size: 2, locals_size: 0 }, code: vec![0x05, 0, 0x05, 99, 0x63, 0x06] },
            )],
            port_sections: Vec::new(),
            line_map_sections: Vec::new(),
        };
        vm.load_pe_image(pe, &image, &CompileOptions::default()).unwrap();

        let mut exbuf = vm.get_exchange_buffer().unwrap();
        vm.push(pe, &mut exbuf).unwrap();
        vm.release_exchange_buffer(exbuf);

        assert_eq!(vm.pe_mut(pe).unwrap().data_memory_mut()[0], 99, "compiled handler's dbstore must actually reach the data area");
    }

    #[test]
    fn destroying_a_pe_drops_its_port_connections() {
        let mut vm = NetVm::new(1);
        let a = vm.create_pe(CoprocessorTable::new());
        let b = vm.create_pe(CoprocessorTable::new());
        vm.connect_ports(
            PortRef { pe: a, port: "out".into() },
            PortRef { pe: b, port: "in".into() },
        )
        .unwrap();
        assert_eq!(vm.connections.len(), 1);
        vm.destroy_pe(a);
        assert_eq!(vm.connections.len(), 0);
    }

    #[test]
    fn operating_on_an_unknown_pe_is_an_error() {
        let mut vm = NetVm::new(1);
        let pe = vm.create_pe(CoprocessorTable::new());
        vm.destroy_pe(pe);
        let mut exbuf = ExchangeBuffer::default();
        assert!(matches!(vm.push(pe, &mut exbuf), Err(NetVmError::UnknownPe)));
    }

    #[test]
    fn invoking_an_unregistered_coprocessor_surfaces_as_a_runtime_error() {
        let mut vm = NetVm::new(1);
        let pe = vm.create_pe(CoprocessorTable::new());
        let exbuf = ExchangeBuffer::default();
        let err = vm.invoke_coprocessor(pe, "lookup", 0, &exbuf).unwrap_err();
        assert!(matches!(err, NetVmError::Runtime(crate::error::RuntimeException::UnknownCoprocessor)));
    }
}
