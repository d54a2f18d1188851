//! Shared test helpers: host memory arena, recording relay, log capture,
//! a fully wired VM fixture and a minimal FDT builder.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::sync::{Arc, Once};

use hypervisor_virtio::devices::virtio::RegisterWindow;
use hypervisor_virtio::mm::{FrameAllocator, Stage2Space};
use hypervisor_virtio::platform::{GUEST_VIRTIO_IO_BASE, GUEST_VIRTIO_IO_SIZE, PAGE_SIZE, VIRTIO_SPI_BASE, VIRTIO_SPI_COUNT};
use hypervisor_virtio::relay::{BackendRelay, MmioEvent, NotifyKind, NotifyRelay, VirtioBackend};
use hypervisor_virtio::virq::VirqPool;
use hypervisor_virtio::{Vm, VmResources};

// ── Host memory ─────────────────────────────────────────────────────

/// Page-aligned, zeroed host memory standing in for hypervisor RAM.
pub struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn base(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Relay that records every notification in call order.
#[derive(Default)]
pub struct RecordingRelay {
    events: std::sync::Mutex<Vec<MmioEvent>>,
}

impl RecordingRelay {
    pub fn take(&self) -> Vec<MmioEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl NotifyRelay for RecordingRelay {
    fn notify_sync(&self, gpa: u64, value: u32) {
        self.events.lock().unwrap().push(MmioEvent { gpa, value, kind: NotifyKind::Blocking });
    }

    fn notify_async(&self, gpa: u64, value: u32) {
        self.events.lock().unwrap().push(MmioEvent { gpa, value, kind: NotifyKind::NonBlocking });
    }
}

pub fn sync_event(gpa: u64, value: u32) -> MmioEvent {
    MmioEvent { gpa, value, kind: NotifyKind::Blocking }
}

pub fn async_event(gpa: u64, value: u32) -> MmioEvent {
    MmioEvent { gpa, value, kind: NotifyKind::NonBlocking }
}

// ── Log capture ─────────────────────────────────────────────────────

thread_local! {
    static LOGS: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGS.with(|l| l.borrow_mut().push((record.level(), record.args().to_string())));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static LOG_INIT: Once = Once::new();

/// Install the capturing logger (once per test binary). Records are
/// kept per thread, so parallel tests do not see each other's output.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
    });
}

/// Drain this thread's captured records.
pub fn take_logs() -> Vec<(log::Level, String)> {
    LOGS.with(|l| std::mem::take(&mut *l.borrow_mut()))
}

/// Drain this thread's captured records and return the warnings.
pub fn take_warnings() -> Vec<String> {
    take_logs()
        .into_iter()
        .filter(|(level, _)| *level == log::Level::Warn)
        .map(|(_, msg)| msg)
        .collect()
}

// ── VM fixture ──────────────────────────────────────────────────────

/// Backend VM's I/O window for its view of the aperture.
pub const BACKEND_IO_BASE: u64 = 0x2000_0000;
pub const BACKEND_IO_SIZE: u64 = 0x100_0000;

/// Host pages available to the frame allocator.
pub const ARENA_PAGES: usize = 64;

/// A VM wired to software collaborators. Field order matters: the VM
/// drops (and frees its pages) before the arena goes away.
pub struct Fixture {
    pub vm: Vm,
    pub relay: Arc<RecordingRelay>,
    pub virqs: Arc<VirqPool>,
    pub guest: Arc<Stage2Space>,
    pub backend: Arc<Stage2Space>,
    pub pages: Arc<spin::Mutex<FrameAllocator>>,
    arena: Arena,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_virq_count(VIRTIO_SPI_COUNT)
    }

    pub fn with_virq_count(count: u32) -> Self {
        init_logging();
        take_logs();

        let arena = Arena::new(ARENA_PAGES);
        let pages = Arc::new(spin::Mutex::new(unsafe {
            FrameAllocator::new(arena.base(), arena.size())
        }));
        let guest = Arc::new(Stage2Space::new(GUEST_VIRTIO_IO_BASE, GUEST_VIRTIO_IO_SIZE));
        let backend = Arc::new(Stage2Space::new(BACKEND_IO_BASE, BACKEND_IO_SIZE));
        let virqs = Arc::new(VirqPool::new(VIRTIO_SPI_BASE, count));
        let relay = Arc::new(RecordingRelay::default());

        let res = VmResources {
            pages: pages.clone(),
            guest_space: guest.clone(),
            backend_space: backend.clone(),
            virqs: virqs.clone(),
            relay: relay.clone(),
        };

        Self {
            vm: Vm::new(1, res),
            relay,
            virqs,
            guest,
            backend,
            pages,
            arena,
        }
    }

    /// Fixture with an initialized aperture of `size` bytes.
    pub fn ready(size: u64) -> Self {
        let mut fx = Self::new();
        fx.vm.virtio_mmio_init(size).unwrap();
        take_logs();
        fx
    }

    /// Guest base of the aperture.
    pub fn gbase(&self) -> u64 {
        self.vm.aperture().guest_base()
    }

    /// Create a device at `gbase + offset` and return its handle and
    /// register window.
    pub fn device_at(&self, offset: u64) -> (hypervisor_virtio::VirtioHandle, RegisterWindow) {
        let handle = self.vm.create_virtio_device(self.gbase() + offset).unwrap();
        let regs = self.vm.virtio_registers(handle).unwrap();
        (handle, regs)
    }

    /// Guest 32-bit store, routed like a trapped write.
    pub fn write(&self, gpa: u64, value: u32) {
        self.vm.handle_mmio(gpa, value as u64, 4, true);
    }

    pub fn free_bytes(&self) -> u64 {
        self.pages.lock().remaining()
    }
}

/// A VM whose relay feeds a real backend. The VM sits behind an `Arc`
/// so the backend can call back into it. Field order matters as above.
pub struct BackendFixture<B: VirtioBackend + 'static> {
    pub vm: Arc<Vm>,
    pub relay: Arc<BackendRelay<B>>,
    pub virqs: Arc<VirqPool>,
    arena: Arena,
}

impl<B: VirtioBackend + 'static> BackendFixture<B> {
    /// Wire `backend` to a VM with an initialized aperture of `size` bytes.
    pub fn ready(backend: B, size: u64) -> Self {
        init_logging();

        let arena = Arena::new(ARENA_PAGES);
        let pages = Arc::new(spin::Mutex::new(unsafe {
            FrameAllocator::new(arena.base(), arena.size())
        }));
        let virqs = Arc::new(VirqPool::new(VIRTIO_SPI_BASE, VIRTIO_SPI_COUNT));
        let relay = Arc::new(BackendRelay::new(backend));

        let res = VmResources {
            pages,
            guest_space: Arc::new(Stage2Space::new(GUEST_VIRTIO_IO_BASE, GUEST_VIRTIO_IO_SIZE)),
            backend_space: Arc::new(Stage2Space::new(BACKEND_IO_BASE, BACKEND_IO_SIZE)),
            virqs: virqs.clone(),
            relay: relay.clone(),
        };
        let mut vm = Vm::new(1, res);
        vm.virtio_mmio_init(size).unwrap();
        take_logs();

        Self { vm: Arc::new(vm), relay, virqs, arena }
    }

    pub fn gbase(&self) -> u64 {
        self.vm.aperture().guest_base()
    }
}

// ── FDT builder ─────────────────────────────────────────────────────

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Minimal flattened device tree writer (one level of children).
pub struct FdtBuilder {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self { structs: Vec::new(), strings: Vec::new() }
    }

    fn u32(&mut self, v: u32) {
        self.structs.extend_from_slice(&v.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.u32(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.u32(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.u32(FDT_PROP);
        self.u32(value.len() as u32);
        self.u32(nameoff);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_u32(&mut self, name: &str, v: u32) -> &mut Self {
        self.prop(name, &v.to_be_bytes())
    }

    pub fn prop_str(&mut self, name: &str, s: &str) -> &mut Self {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        self.prop(name, &v)
    }

    /// `reg` with 2 address cells and 1 size cell.
    pub fn prop_reg(&mut self, base: u64, size: u32) -> &mut Self {
        let mut v = Vec::new();
        v.extend_from_slice(&base.to_be_bytes());
        v.extend_from_slice(&size.to_be_bytes());
        self.prop("reg", &v)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.u32(FDT_END);

        let off_rsvmap = 40u32;
        let off_struct = off_rsvmap + 16;
        let off_strings = off_struct + self.structs.len() as u32;
        let total = off_strings + self.strings.len() as u32;

        let mut blob = Vec::with_capacity(total as usize);
        for v in [
            FDT_MAGIC,
            total,
            off_struct,
            off_strings,
            off_rsvmap,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&v.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// A device tree with one `virtio,mmio` node per `(base, size)`, plus an
/// unrelated UART node.
pub fn virtio_dtb(windows: &[(u64, u32)]) -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 1)
        .prop_str("compatible", "linux,dummy-virt");

    b.begin_node("pl011@9000000")
        .prop_str("compatible", "arm,pl011")
        .prop_reg(0x0900_0000, 0x1000)
        .end_node();

    for &(base, size) in windows {
        let name = format!("virtio_mmio@{:x}", base);
        b.begin_node(&name)
            .prop_str("compatible", "virtio,mmio")
            .prop_reg(base, size)
            .end_node();
    }

    b.end_node();
    b.finish()
}
