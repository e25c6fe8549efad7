/*
   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

      http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

/*
  Android boot image handling. The header layout is the v0 layout from
  AOSP mkbootimg:

  +-----------------+
  | boot header     | 1 page
  +-----------------+
  | kernel          | n pages
  +-----------------+
  | ramdisk         | m pages
  +-----------------+
  | second stage    | o pages
  +-----------------+
*/

use crate::blockdev::{block_cnt, read_partition_bytes, BlockDevice};
use crate::error::BootError;
use crate::gpt;
use crate::platform::{Environment, Platform};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
/// Size of the serialised v0 header.
pub const BOOT_IMG_HDR_LEN: usize = 1632;

/// Room kept after the image payload for a boot signature block.
pub const BOOT_SIGNATURE_MAX_SIZE: u64 = 4096;
pub const BOOT_MAX_IMAGE_SIZE: u64 = 32 * 1024 * 1024;

const PAGE_SIZE_MIN: u32 = 2048;
const PAGE_SIZE_MAX: u32 = 16384;

/// How many bytes to stage between watchdog kicks.
const STAGING_BURST_BYTES: u64 = 1024 * 1024;

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[derive(Debug, Clone)]
pub struct BootImgHdr {
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub header_version: u32,
    pub os_version: u32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    pub id: [u32; 8],
    pub extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

impl BootImgHdr {
    pub fn parse(raw: &[u8]) -> Result<BootImgHdr, BootError> {
        if raw.len() < BOOT_IMG_HDR_LEN {
            return Err(BootError::Invalid);
        }
        if raw[0..8] != BOOT_MAGIC {
            return Err(BootError::Invalid);
        }
        let mut name = [0u8; BOOT_NAME_SIZE];
        name.copy_from_slice(&raw[48..64]);
        let mut cmdline = [0u8; BOOT_ARGS_SIZE];
        cmdline.copy_from_slice(&raw[64..576]);
        let mut id = [0u32; 8];
        for (i, word) in id.iter_mut().enumerate() {
            *word = le32(raw, 576 + i * 4);
        }
        let mut extra_cmdline = [0u8; BOOT_EXTRA_ARGS_SIZE];
        extra_cmdline.copy_from_slice(&raw[608..BOOT_IMG_HDR_LEN]);
        Ok(BootImgHdr {
            kernel_size: le32(raw, 8),
            kernel_addr: le32(raw, 12),
            ramdisk_size: le32(raw, 16),
            ramdisk_addr: le32(raw, 20),
            second_size: le32(raw, 24),
            second_addr: le32(raw, 28),
            tags_addr: le32(raw, 32),
            page_size: le32(raw, 36),
            header_version: le32(raw, 40),
            os_version: le32(raw, 44),
            name,
            cmdline,
            id,
            extra_cmdline,
        })
    }

    /// The loader refuses pages outside [2048, 16384] or sizes that are
    /// not a power of two.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.page_size < PAGE_SIZE_MIN
            || self.page_size > PAGE_SIZE_MAX
            || self.page_size & (self.page_size - 1) != 0
        {
            return Err(BootError::Invalid);
        }
        Ok(())
    }

    fn round_to_page(&self, size: u32) -> u64 {
        let page = self.page_size as u64;
        (size as u64 + page - 1) / page * page
    }

    /// Bytes the whole image spans on flash, signature room included.
    pub fn image_span(&self) -> u64 {
        self.page_size as u64
            + self.round_to_page(self.kernel_size)
            + self.round_to_page(self.ramdisk_size)
            + self.round_to_page(self.second_size)
            + BOOT_SIGNATURE_MAX_SIZE
    }

    /// Enforce the staged-image ceiling, in blocks so that the check
    /// matches what is actually read.
    pub fn check_size_bound(&self, block_size: usize) -> Result<(), BootError> {
        if block_cnt(self.image_span(), block_size) > block_cnt(BOOT_MAX_IMAGE_SIZE, block_size) {
            return Err(BootError::Invalid);
        }
        Ok(())
    }

    /// Kernel command line from the header, up to the first NUL.
    pub fn cmdline_str(&self) -> String {
        let end = self
            .cmdline
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BOOT_ARGS_SIZE);
        String::from_utf8_lossy(&self.cmdline[..end]).into_owned()
    }
}

/// A boot image staged in RAM, owned for the duration of one attempt.
#[derive(Debug)]
pub struct StagedImage {
    pub hdr: BootImgHdr,
    data: Vec<u8>,
}

impl StagedImage {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn kernel(&self) -> &[u8] {
        let start = self.hdr.page_size as usize;
        &self.data[start..start + self.hdr.kernel_size as usize]
    }

    pub fn ramdisk(&self) -> &[u8] {
        let start = (self.hdr.page_size as u64 + self.hdr.round_to_page(self.hdr.kernel_size)) as usize;
        &self.data[start..start + self.hdr.ramdisk_size as usize]
    }
}

/// Load an Android boot image from the named partition into RAM.
///
/// The header blocks come first so the image can be bounded before the
/// bulk of it is staged; the remainder is read in bursts with the
/// watchdog re-armed in between.
pub fn load_boot_image(
    dev: &mut dyn BlockDevice,
    platform: &mut dyn Platform,
    part_name: &str,
) -> Result<StagedImage, BootError> {
    let part = gpt::find_partition(dev, part_name)?;
    let blksz = dev.block_size();

    let hdr_blkcnt = block_cnt(BOOT_IMG_HDR_LEN as u64, blksz);
    let head = read_partition_bytes(dev, &part, 0, (hdr_blkcnt as usize) * blksz)?;
    let hdr = BootImgHdr::parse(&head)?;
    hdr.validate()?;
    hdr.check_size_bound(blksz)?;

    let total_blkcnt = block_cnt(hdr.image_span(), blksz);
    let rest_blkcnt = total_blkcnt.saturating_sub(hdr_blkcnt);

    let mut data = head;
    data.reserve((rest_blkcnt as usize) * blksz);
    let burst = block_cnt(STAGING_BURST_BYTES, blksz);
    let mut offset = hdr_blkcnt;
    let mut remaining = rest_blkcnt;
    while remaining > 0 {
        let count = remaining.min(burst);
        let mut chunk = read_partition_bytes(dev, &part, offset, (count as usize) * blksz)?;
        data.append(&mut chunk);
        offset += count;
        remaining -= count;
        platform.watchdog_reset();
    }

    Ok(StagedImage { hdr, data })
}

/// Append to the `bootargs` environment value. When `bootargs` is not
/// set yet, a single leading space of `s` is dropped.
pub fn append_to_bootargs(env: &mut dyn Environment, s: &str) {
    match env.get("bootargs") {
        None => {
            let s = s.strip_prefix(' ').unwrap_or(s);
            env.set("bootargs", s);
        }
        Some(current) => {
            env.set("bootargs", &format!("{}{}", current, s));
        }
    }
}

/// Boot the staged image. The header command line becomes the base of
/// `bootargs` with the previous value appended after a single space,
/// then control is handed to the kernel. Returns only if the hand-off
/// failed.
pub fn boot_staged_image(
    env: &mut dyn Environment,
    platform: &mut dyn Platform,
    image: &StagedImage,
) -> BootError {
    match env.get("bootargs") {
        Some(saved) => {
            env.set("bootargs", &image.hdr.cmdline_str());
            append_to_bootargs(env, " ");
            append_to_bootargs(env, &saved);
        }
        None => {
            env.set("bootargs", &image.hdr.cmdline_str());
        }
    }
    platform.boot_kernel(image)
}
