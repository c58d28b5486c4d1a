//! `/dev/kfd` backed driver.

use crate::driver::{KfdDriver, KfdError, KfdVersion};
use crate::ioctl::{
    CreateEventArgs, CreateQueueArgs, DbgTrapArgs, DestroyEventArgs, DestroyQueueArgs,
    GetVersionArgs, SetCuMaskArgs, UpdateQueueArgs, AMDKFD_IOC_CREATE_EVENT,
    AMDKFD_IOC_CREATE_QUEUE, AMDKFD_IOC_DBG_TRAP, AMDKFD_IOC_DESTROY_EVENT,
    AMDKFD_IOC_DESTROY_QUEUE, AMDKFD_IOC_GET_VERSION, AMDKFD_IOC_SET_CU_MASK,
    AMDKFD_IOC_UPDATE_QUEUE,
};
use aql_ring::{DoorbellSink, MmioDoorbell};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

const KFD_PATH: &str = "/dev/kfd";

/// Doorbells are handed out in two-page slices per process and device.
const DOORBELL_PAGE_BYTES: u64 = 8192;

struct DoorbellPage {
    base: *mut libc::c_void,
}

// SAFETY: the page is device MMIO shared by every queue on the device; writes go through
// `MmioDoorbell`.
unsafe impl Send for DoorbellPage {}
unsafe impl Sync for DoorbellPage {}

impl Drop for DoorbellPage {
    fn drop(&mut self) {
        // SAFETY: mapped in `KfdDevice::doorbell_page` with this length.
        unsafe { libc::munmap(self.base, DOORBELL_PAGE_BYTES as usize) };
    }
}

/// Keeps the page mapped for as long as a queue holds its doorbell.
struct PageDoorbell {
    _page: Arc<DoorbellPage>,
    register: MmioDoorbell,
}

impl DoorbellSink for PageDoorbell {
    fn write_u64(&self, value: u64) {
        self.register.write_u64(value);
    }

    fn write_u32(&self, value: u32) {
        self.register.write_u32(value);
    }
}

pub struct KfdDevice {
    fd: OwnedFd,
    version: KfdVersion,
    doorbell_pages: Mutex<HashMap<(u32, u64), Arc<DoorbellPage>>>,
}

impl KfdDevice {
    pub fn open() -> Result<Self, KfdError> {
        let path = b"/dev/kfd\0";
        // SAFETY: NUL-terminated path.
        let raw = unsafe { libc::open(path.as_ptr().cast(), libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(KfdError::Open {
                path: KFD_PATH,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: freshly opened, owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut args = GetVersionArgs::default();
        ioctl(&fd, AMDKFD_IOC_GET_VERSION, &mut args, "get_version")?;
        let version = KfdVersion::new(args.major_version, args.minor_version);
        tracing::debug!(%version, "opened {KFD_PATH}");

        Ok(Self {
            fd,
            version,
            doorbell_pages: Mutex::new(HashMap::new()),
        })
    }

    fn doorbell_page(&self, gpu_id: u32, mmap_offset: u64) -> Result<Arc<DoorbellPage>, KfdError> {
        let mut pages = self
            .doorbell_pages
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(page) = pages.get(&(gpu_id, mmap_offset)) {
            return Ok(page.clone());
        }

        // SAFETY: the kernel validates the offset; the mapping is owned by the returned page.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                DOORBELL_PAGE_BYTES as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                mmap_offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(KfdError::DoorbellMap {
                offset: mmap_offset,
                source: io::Error::last_os_error(),
            });
        }
        let page = Arc::new(DoorbellPage { base });
        pages.insert((gpu_id, mmap_offset), page.clone());
        Ok(page)
    }
}

fn ioctl<T>(fd: &OwnedFd, request: u32, args: &mut T, name: &'static str) -> Result<u32, KfdError> {
    loop {
        // SAFETY: `args` is the ABI struct matching `request`.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, args as *mut T) };
        if rc >= 0 {
            return Ok(rc as u32);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            _ => {
                return Err(KfdError::Ioctl {
                    request: name,
                    source: err,
                })
            }
        }
    }
}

impl KfdDriver for KfdDevice {
    fn version(&self) -> KfdVersion {
        self.version
    }

    fn create_queue(&self, args: &mut CreateQueueArgs) -> Result<(), KfdError> {
        ioctl(&self.fd, AMDKFD_IOC_CREATE_QUEUE, args, "create_queue").map(drop)
    }

    fn destroy_queue(&self, queue_id: u32) -> Result<(), KfdError> {
        let mut args = DestroyQueueArgs { queue_id, pad: 0 };
        ioctl(&self.fd, AMDKFD_IOC_DESTROY_QUEUE, &mut args, "destroy_queue").map(drop)
    }

    fn update_queue(&self, args: &UpdateQueueArgs) -> Result<(), KfdError> {
        let mut args = *args;
        ioctl(&self.fd, AMDKFD_IOC_UPDATE_QUEUE, &mut args, "update_queue").map(drop)
    }

    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> Result<(), KfdError> {
        let mut args = SetCuMaskArgs {
            queue_id,
            num_cu_mask: (mask.len() * 32) as u32,
            cu_mask_ptr: mask.as_ptr() as u64,
        };
        ioctl(&self.fd, AMDKFD_IOC_SET_CU_MASK, &mut args, "set_cu_mask").map(drop)
    }

    fn map_doorbell(
        &self,
        gpu_id: u32,
        doorbell_offset: u64,
    ) -> Result<Arc<dyn DoorbellSink>, KfdError> {
        let mmap_offset = doorbell_offset & !(DOORBELL_PAGE_BYTES - 1);
        let within = (doorbell_offset & (DOORBELL_PAGE_BYTES - 1)) as usize;
        let page = self.doorbell_page(gpu_id, mmap_offset)?;
        // SAFETY: `within` is inside the page, which `PageDoorbell` keeps mapped.
        let register = unsafe { MmioDoorbell::from_raw(page.base.cast::<u8>().add(within).cast()) }
            .ok_or(KfdError::InvalidArgument("null doorbell mapping"))?;
        Ok(Arc::new(PageDoorbell {
            _page: page,
            register,
        }))
    }

    fn create_event(&self, args: &mut CreateEventArgs) -> Result<(), KfdError> {
        ioctl(&self.fd, AMDKFD_IOC_CREATE_EVENT, args, "create_event").map(drop)
    }

    fn destroy_event(&self, event_id: u32) -> Result<(), KfdError> {
        let mut args = DestroyEventArgs { event_id, pad: 0 };
        ioctl(&self.fd, AMDKFD_IOC_DESTROY_EVENT, &mut args, "destroy_event").map(drop)
    }

    fn dbg_trap(&self, args: &mut DbgTrapArgs) -> Result<u32, KfdError> {
        ioctl(&self.fd, AMDKFD_IOC_DBG_TRAP, args, "dbg_trap")
    }
}
