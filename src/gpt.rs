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

//! GPT partition lookup, the mandatory-layout verifier run before a new
//! partition table is flashed, and the OSIP record written into the MBR
//! boot-code region.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::blockdev::{block_cnt, BlockDevice, PartitionInfo};
use crate::error::BootError;

/// "EFI PART"
const EFI_SIGNATURE: u64 = 0x5452_4150_2049_4645;
const GPT_PRIMARY_LBA: u64 = 1;
const GPT_HEADER_LEN: usize = 92;
const GPT_ENTRY_MIN_LEN: usize = 128;
/// UTF-16LE partition name field, 36 code units.
pub const GPT_NAME_LEN: usize = 72;

const MBR_SIGNATURE_OFFSET: usize = 510;

const BLOCK_SIZE: usize = 512;
const ONE_MIB: u64 = 1024 * 1024;

/// The partitions every disk must start with, in order, with their
/// sizes in MiB.
const MANDATORY_PARTS: [(&str, u64); 3] = [("u-boot", 5), ("factory", 1), ("security", 1)];

/// Entry of the abstract partition-list fragment: a UTF-16LE label
/// followed by the partition size in MiB (u64, little-endian).
const ABSTRACT_ENTRY_LEN: usize = GPT_NAME_LEN + 8;

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

fn put_le16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_le32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Encode a partition name the way GPT stores it: UTF-16LE with a NUL
/// terminator.
fn utf16le_label(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((name.len() + 1) * 2);
    for unit in name.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub header_size: u32,
    pub header_crc32: u32,
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub sizeof_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    /// Parse the header fields, checking the signature and bounds only.
    pub fn parse(block: &[u8]) -> Result<GptHeader, BootError> {
        if block.len() < GPT_HEADER_LEN {
            return Err(BootError::Invalid);
        }
        if le64(block, 0) != EFI_SIGNATURE {
            return Err(BootError::Invalid);
        }
        let header_size = le32(block, 12);
        if (header_size as usize) < GPT_HEADER_LEN || (header_size as usize) > block.len() {
            return Err(BootError::Invalid);
        }
        Ok(GptHeader {
            header_size,
            header_crc32: le32(block, 16),
            partition_entry_lba: le64(block, 72),
            num_partition_entries: le32(block, 80),
            sizeof_partition_entry: le32(block, 84),
            partition_entry_array_crc32: le32(block, 88),
        })
    }

    /// Parse and additionally verify the header CRC32.
    pub fn parse_checked(block: &[u8]) -> Result<GptHeader, BootError> {
        let header = GptHeader::parse(block)?;
        let mut raw = block[..header.header_size as usize].to_vec();
        raw[16..20].copy_from_slice(&[0, 0, 0, 0]);
        let algo = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        if algo.checksum(&raw) != header.header_crc32 {
            return Err(BootError::Invalid);
        }
        Ok(header)
    }
}

#[derive(Debug, Clone)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub partition_name: [u8; GPT_NAME_LEN],
}

impl GptEntry {
    pub fn parse(raw: &[u8]) -> Result<GptEntry, BootError> {
        if raw.len() < GPT_ENTRY_MIN_LEN {
            return Err(BootError::Invalid);
        }
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&raw[0..16]);
        let mut partition_name = [0u8; GPT_NAME_LEN];
        partition_name.copy_from_slice(&raw[56..56 + GPT_NAME_LEN]);
        Ok(GptEntry {
            type_guid,
            starting_lba: le64(raw, 32),
            ending_lba: le64(raw, 40),
            partition_name,
        })
    }

    pub fn in_use(&self) -> bool {
        self.type_guid.iter().any(|&b| b != 0)
    }

    /// Decoded partition name, up to the first NUL.
    pub fn name(&self) -> String {
        let mut units = Vec::new();
        for pair in self.partition_name.chunks(2) {
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16_lossy(&units)
    }

    pub fn size_mib(&self) -> u64 {
        (self.ending_lba - self.starting_lba + 1) * BLOCK_SIZE as u64 / ONE_MIB
    }
}

/// Look a partition up by name. This is the only way the rest of the
/// crate obtains a partition handle.
pub fn find_partition(dev: &mut dyn BlockDevice, name: &str) -> Result<PartitionInfo, BootError> {
    let blksz = dev.block_size();
    let mut hdr_block = vec![0u8; blksz];
    dev.read_blocks(GPT_PRIMARY_LBA, 1, &mut hdr_block)?;
    let header = GptHeader::parse_checked(&hdr_block)?;

    let entry_len = header.sizeof_partition_entry as usize;
    if entry_len < GPT_ENTRY_MIN_LEN || header.num_partition_entries == 0 {
        return Err(BootError::Invalid);
    }
    // A table bigger than this is not something the flasher produces.
    if header.num_partition_entries > 1024 {
        return Err(BootError::Invalid);
    }

    let array_len = entry_len * header.num_partition_entries as usize;
    let blocks = block_cnt(array_len as u64, blksz);
    let mut array = vec![0u8; (blocks as usize) * blksz];
    dev.read_blocks(header.partition_entry_lba, blocks, &mut array)?;
    let array = &array[..array_len];

    let algo = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    if algo.checksum(array) != header.partition_entry_array_crc32 {
        log::warn!("GPT partition entry array checksum mismatch");
        return Err(BootError::Invalid);
    }

    for i in 0..header.num_partition_entries as usize {
        let entry = GptEntry::parse(&array[i * entry_len..(i + 1) * entry_len])?;
        if !entry.in_use() {
            continue;
        }
        if entry.name() == name {
            return Ok(PartitionInfo {
                name: name.to_string(),
                start: entry.starting_lba,
                blocks: entry.ending_lba - entry.starting_lba + 1,
            });
        }
    }
    Err(BootError::NotFound)
}

fn has_mbr_signature(frag: &[u8]) -> bool {
    frag.len() >= MBR_SIGNATURE_OFFSET + 2
        && frag[MBR_SIGNATURE_OFFSET] == 0x55
        && frag[MBR_SIGNATURE_OFFSET + 1] == 0xaa
}

/// Check that a partition table about to be flashed keeps the mandatory
/// layout prefix: `u-boot` (5 MiB), `factory` (1 MiB), `security`
/// (1 MiB), in that order.
///
/// The input is either a raw MBR + GPT fragment (detected by the 0xAA55
/// signature) or an abstract list of {label, size_mib} entries.
pub fn verify_partition_layout(frag: &[u8]) -> Result<(), BootError> {
    if has_mbr_signature(frag) {
        verify_gpt_fragment(frag)
    } else {
        verify_abstract_fragment(frag)
    }
}

fn verify_gpt_fragment(frag: &[u8]) -> Result<(), BootError> {
    let hdr_off = GPT_PRIMARY_LBA as usize * BLOCK_SIZE;
    if frag.len() < hdr_off + GPT_HEADER_LEN {
        return Err(BootError::Invalid);
    }
    let header = GptHeader::parse(&frag[hdr_off..])?;
    let entries_off = header.partition_entry_lba as usize * BLOCK_SIZE;
    let entry_len = header.sizeof_partition_entry as usize;
    if entry_len < GPT_ENTRY_MIN_LEN {
        return Err(BootError::Invalid);
    }

    for (i, (name, size_mib)) in MANDATORY_PARTS.iter().enumerate() {
        let off = entries_off + i * entry_len;
        if frag.len() < off + entry_len {
            return Err(BootError::Invalid);
        }
        let entry = GptEntry::parse(&frag[off..off + entry_len])?;
        let label = utf16le_label(name);
        if entry.partition_name[..label.len()] != label[..] {
            return Err(BootError::Invalid);
        }
        if entry.size_mib() != *size_mib {
            return Err(BootError::Invalid);
        }
    }
    Ok(())
}

fn verify_abstract_fragment(frag: &[u8]) -> Result<(), BootError> {
    for (i, (name, size_mib)) in MANDATORY_PARTS.iter().enumerate() {
        let off = i * ABSTRACT_ENTRY_LEN;
        if frag.len() < off + ABSTRACT_ENTRY_LEN {
            return Err(BootError::Invalid);
        }
        let label = utf16le_label(name);
        if frag[off..off + label.len()] != label[..] {
            return Err(BootError::Invalid);
        }
        if le64(frag, off + GPT_NAME_LEN) != *size_mib {
            return Err(BootError::Invalid);
        }
    }
    Ok(())
}

/// "$OS$"
pub const OSIP_MAGIC: u32 = 0x2453_4f24;
const OSIP_HEADER_LEN: usize = 32;
const OSII_ENTRY_LEN: usize = 24;
/// One populated entry plus the reserved tail.
const OSII_NUM_ENTRIES: usize = 15;

const OSII0_OFF: usize = OSIP_HEADER_LEN;

/// Write the OSIP record into the boot-code region of an MBR block
/// about to be flashed. The first OS image pointer targets the u-boot
/// image; its LBA depends on whether the block already carries an MBR
/// signature (MBR-only layout) or precedes a GPT.
pub fn populate_mbr_boot_code(mbr: &mut [u8]) -> Result<(), BootError> {
    if mbr.len() < BLOCK_SIZE {
        return Err(BootError::Invalid);
    }
    let image_lba: u32 = if has_mbr_signature(mbr) {
        0x0000_0028
    } else {
        0x0000_0800 // 1 MiB in
    };

    let header_size = (OSIP_HEADER_LEN + OSII_ENTRY_LEN) as u16;
    for b in mbr[..header_size as usize].iter_mut() {
        *b = 0;
    }

    put_le32(mbr, 0, OSIP_MAGIC);
    mbr[5] = 0; // version minor
    mbr[6] = 1; // version major
    mbr[8] = 1; // number of pointers
    mbr[9] = 1; // number of images
    put_le16(mbr, 10, header_size);

    put_le32(mbr, OSII0_OFF + 4, image_lba);
    put_le32(mbr, OSII0_OFF + 8, 0x0110_0000); // load address
    put_le32(mbr, OSII0_OFF + 12, 0x0110_1000); // entry point
    put_le32(mbr, OSII0_OFF + 16, 0x0000_2800); // image size in blocks (5 MiB)
    mbr[OSII0_OFF + 20] = 0x0f; // attribute

    let mut checksum = 0u8;
    for b in mbr[..header_size as usize].iter() {
        checksum ^= *b;
    }
    mbr[7] = checksum;

    let reserved_end = OSIP_HEADER_LEN + OSII_NUM_ENTRIES * OSII_ENTRY_LEN;
    for b in mbr[OSII0_OFF + OSII_ENTRY_LEN..reserved_end].iter_mut() {
        *b = 0xff;
    }
    Ok(())
}
