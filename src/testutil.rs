//! In-memory stand-ins for the board: a RAM block device carrying a
//! real GPT, a boot-image builder, a scripted platform and a map-backed
//! environment. Test-only.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::blockdev::{write_partition_bytes, BlockDevice};
use crate::bootloader::message::{BootCtrl, BootloaderMessage};
use crate::error::BootError;
use crate::gpt::find_partition;
use crate::image::StagedImage;
use crate::platform::{edison, Environment, Platform, RebootTarget};

const BLOCK_SIZE: usize = 512;

pub struct RamBlockDevice {
    data: Vec<u8>,
    pub write_log: Vec<(u64, u64)>,
    pub wp_ranges: Vec<(u64, u64)>,
}

impl RamBlockDevice {
    pub fn new(blocks: u64) -> Self {
        RamBlockDevice {
            data: vec![0u8; (blocks as usize) * BLOCK_SIZE],
            write_log: Vec::new(),
            wp_ranges: Vec::new(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn range(&self, start: u64, count: u64) -> Result<std::ops::Range<usize>, BootError> {
        let begin = (start as usize).checked_mul(BLOCK_SIZE).ok_or(BootError::Io)?;
        let end = begin + (count as usize) * BLOCK_SIZE;
        if end > self.data.len() {
            return Err(BootError::Io);
        }
        Ok(begin..end)
    }
}

impl BlockDevice for RamBlockDevice {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64
    }

    fn read_blocks(&mut self, start: u64, count: u64, dst: &mut [u8]) -> Result<(), BootError> {
        let range = self.range(start, count)?;
        if dst.len() != (count as usize) * BLOCK_SIZE {
            return Err(BootError::Io);
        }
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_blocks(&mut self, start: u64, count: u64, src: &[u8]) -> Result<(), BootError> {
        let range = self.range(start, count)?;
        if src.len() != (count as usize) * BLOCK_SIZE {
            return Err(BootError::Io);
        }
        self.data[range].copy_from_slice(src);
        self.write_log.push((start, count));
        Ok(())
    }

    fn power_on_write_protect(&mut self, from: u64, length: u64) -> Result<(), BootError> {
        self.wp_ranges.push((from, length));
        Ok(())
    }
}

fn utf16le(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in name.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Builds a disk whose primary GPT is internally consistent (both
/// checksums valid), with partitions laid out back to back from LBA 34.
pub struct DiskBuilder {
    parts: Vec<(String, u64)>,
}

impl DiskBuilder {
    pub fn new() -> Self {
        DiskBuilder { parts: Vec::new() }
    }

    pub fn part_mib(mut self, name: &str, mib: u64) -> Self {
        self.parts.push((name.to_string(), mib * 2048));
        self
    }

    pub fn build(self) -> RamBlockDevice {
        const ENTRY_LEN: usize = 128;
        const FIRST_USABLE: u64 = 34;

        let num = self.parts.len();
        let mut entries = vec![0u8; num * ENTRY_LEN];
        let mut next_lba = FIRST_USABLE;
        for (i, (name, blocks)) in self.parts.iter().enumerate() {
            let e = &mut entries[i * ENTRY_LEN..(i + 1) * ENTRY_LEN];
            // type guid: any non-zero marks the entry in use
            e[0..16].copy_from_slice(&[0x0f; 16]);
            e[16] = i as u8 + 1; // unique guid
            e[32..40].copy_from_slice(&next_lba.to_le_bytes());
            let end = next_lba + blocks - 1;
            e[40..48].copy_from_slice(&end.to_le_bytes());
            let label = utf16le(name);
            e[56..56 + label.len()].copy_from_slice(&label);
            next_lba = end + 1;
        }
        let last_usable = next_lba - 1;
        let total_blocks = next_lba + 6;

        let algo = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let array_crc = algo.checksum(&entries);

        let mut header = vec![0u8; 92];
        header[0..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes());
        header[32..40].copy_from_slice(&(total_blocks - 1).to_le_bytes());
        header[40..48].copy_from_slice(&FIRST_USABLE.to_le_bytes());
        header[48..56].copy_from_slice(&last_usable.to_le_bytes());
        header[56..72].copy_from_slice(&[0x42; 16]);
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&(num as u32).to_le_bytes());
        header[84..88].copy_from_slice(&(ENTRY_LEN as u32).to_le_bytes());
        header[88..92].copy_from_slice(&array_crc.to_le_bytes());
        let header_crc = algo.checksum(&header);
        header[16..20].copy_from_slice(&header_crc.to_le_bytes());

        let mut dev = RamBlockDevice::new(total_blocks);
        // protective MBR signature
        dev.data[510] = 0x55;
        dev.data[511] = 0xaa;
        dev.data[BLOCK_SIZE..BLOCK_SIZE + 92].copy_from_slice(&header);
        dev.data[2 * BLOCK_SIZE..2 * BLOCK_SIZE + entries.len()].copy_from_slice(&entries);
        dev.write_log.clear();
        dev
    }
}

/// The layout every test device starts from.
pub fn standard_disk() -> RamBlockDevice {
    DiskBuilder::new()
        .part_mib("u-boot", 5)
        .part_mib("factory", 1)
        .part_mib("security", 1)
        .part_mib("misc", 1)
        .part_mib("boot_a", 1)
        .part_mib("boot_b", 1)
        .part_mib("recovery", 1)
        .build()
}

pub struct BootImage {
    pub name: String,
    pub page_size: u32,
    pub kernel: Vec<u8>,
    pub ramdisk: Vec<u8>,
    pub cmdline: String,
}

impl BootImage {
    pub fn minimal(name: &str) -> Self {
        BootImage {
            name: name.to_string(),
            page_size: 2048,
            kernel: vec![0x5a; 1024],
            ramdisk: Vec::new(),
            cmdline: "console=ttyS0".to_string(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let page = self.page_size as usize;
        let hdr_region = page.max(1632);
        let mut out = vec![0u8; hdr_region];
        out[0..8].copy_from_slice(b"ANDROID!");
        out[8..12].copy_from_slice(&(self.kernel.len() as u32).to_le_bytes());
        out[12..16].copy_from_slice(&0x1000_8000u32.to_le_bytes());
        out[16..20].copy_from_slice(&(self.ramdisk.len() as u32).to_le_bytes());
        out[20..24].copy_from_slice(&0x1100_0000u32.to_le_bytes());
        out[36..40].copy_from_slice(&self.page_size.to_le_bytes());
        let name = self.name.as_bytes();
        out[48..48 + name.len().min(16)].copy_from_slice(&name[..name.len().min(16)]);
        let cmdline = self.cmdline.as_bytes();
        out[64..64 + cmdline.len().min(512)].copy_from_slice(&cmdline[..cmdline.len().min(512)]);

        let round = |len: usize| (len + page - 1) / page * page;
        let mut section = self.kernel.clone();
        section.resize(round(self.kernel.len()), 0);
        out.extend_from_slice(&section);
        let mut section = self.ramdisk.clone();
        section.resize(round(self.ramdisk.len()), 0);
        out.extend_from_slice(&section);
        out
    }

    pub fn write_to(&self, dev: &mut RamBlockDevice, part_name: &str) {
        let part = find_partition(dev, part_name).unwrap();
        write_partition_bytes(dev, &part, 0, &self.bytes()).unwrap();
    }
}

pub fn valid_image(name: &str) -> BootImage {
    BootImage::minimal(name)
}

/// Scribble over a partition's first block so no header survives.
pub fn corrupt_partition(dev: &mut RamBlockDevice, part_name: &str) {
    let part = find_partition(dev, part_name).unwrap();
    write_partition_bytes(dev, &part, 0, &[0xde; BLOCK_SIZE]).unwrap();
}

pub fn seed_boot_ctrl(dev: &mut RamBlockDevice, ctrl: &BootCtrl) {
    let misc = find_partition(dev, "misc").unwrap();
    let mut msg = BootloaderMessage::read_from(dev, &misc).unwrap();
    msg.set_boot_ctrl(ctrl);
    msg.write_to(dev, &misc).unwrap();
}

pub fn read_boot_ctrl(dev: &mut RamBlockDevice) -> BootCtrl {
    let misc = find_partition(dev, "misc").unwrap();
    BootloaderMessage::read_from(dev, &misc).unwrap().boot_ctrl()
}

/// Panic payload used by the mock to model a hand-off that does not
/// come back.
pub struct KernelEntered;

/// Run a boot flow to completion, catching the mock's kernel entry.
/// `Some` means a kernel was entered; `None` means the flow returned.
pub fn catch_kernel_entry<F: FnOnce() -> BootError>(f: F) -> Option<KernelEntered> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => None,
        Err(payload) => {
            if payload.is::<KernelEntered>() {
                Some(KernelEntered)
            } else {
                resume_unwind(payload)
            }
        }
    }
}

enum KernelAction {
    Enter,
    Fail,
}

pub struct MockPlatform {
    pub mem: HashMap<u32, u8>,
    /// Values returned by successive reads of the button status byte;
    /// once drained, reads fall back to `mem`.
    pub gpio_script: VecDeque<u8>,
    pub ipc_log: Vec<(u32, u32)>,
    pub watchdog_kicks: usize,
    pub mdelays: Vec<u32>,
    /// Header names of the images handed to `boot_kernel`.
    pub boot_attempts: Vec<String>,
    kernel_actions: VecDeque<KernelAction>,
    pub fastboot_runs: usize,
    pub resets: usize,
    pub hangs: usize,
    pub target: RebootTarget,
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            mem: HashMap::new(),
            gpio_script: VecDeque::new(),
            ipc_log: Vec::new(),
            watchdog_kicks: 0,
            mdelays: Vec::new(),
            boot_attempts: Vec::new(),
            kernel_actions: VecDeque::new(),
            fastboot_runs: 0,
            resets: 0,
            hangs: 0,
            target: RebootTarget::Normal,
        }
    }

    /// The next hand-off does not return.
    pub fn enter_kernel_next(&mut self) {
        self.kernel_actions.push_back(KernelAction::Enter);
    }

    /// The next hand-off comes straight back.
    pub fn fail_kernel_next(&mut self) {
        self.kernel_actions.push_back(KernelAction::Fail);
    }
}

impl Platform for MockPlatform {
    fn read_byte(&mut self, addr: u32) -> u8 {
        if addr == edison::GPIO_STATUS {
            if let Some(v) = self.gpio_script.pop_front() {
                return v;
            }
        }
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, addr: u32, value: u8) {
        self.mem.insert(addr, value);
    }

    fn ipc_raw(&mut self, cmd: u32, sub: u32) -> Result<(), BootError> {
        self.ipc_log.push((cmd, sub));
        Ok(())
    }

    fn watchdog_reset(&mut self) {
        self.watchdog_kicks += 1;
    }

    fn mdelay(&mut self, ms: u32) {
        self.mdelays.push(ms);
    }

    fn boot_kernel(&mut self, image: &StagedImage) -> BootError {
        let name_end = image
            .hdr
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(image.hdr.name.len());
        self.boot_attempts
            .push(String::from_utf8_lossy(&image.hdr.name[..name_end]).into_owned());
        match self.kernel_actions.pop_front() {
            Some(KernelAction::Enter) => std::panic::panic_any(KernelEntered),
            Some(KernelAction::Fail) | None => BootError::Invalid,
        }
    }

    fn run_fastboot(&mut self) {
        self.fastboot_runs += 1;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn hang(&mut self) {
        self.hangs += 1;
    }

    fn reboot_target(&mut self) -> RebootTarget {
        self.target
    }
}

pub struct MockEnv {
    vars: BTreeMap<String, String>,
}

impl MockEnv {
    pub fn new() -> Self {
        MockEnv {
            vars: BTreeMap::new(),
        }
    }
}

impl Environment for MockEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    fn unset(&mut self, name: &str) {
        self.vars.remove(name);
    }
}
