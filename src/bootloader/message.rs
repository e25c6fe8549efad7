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
  We use the same storage layout as in Android: the bootloader_message
  structure sits at the start of the misc partition and the A/B
  boot-control record overlays its slot_suffix field. The record layout
  is a compatibility contract with the running OS, which updates the
  successful_boot flags after it comes up.
*/

use bounded_integer::*;

use crate::blockdev::{read_partition_bytes, write_partition_bytes, BlockDevice, PartitionInfo};
use crate::error::BootError;

/// Layout of the bootloader_message structure:
/// 0     command[32]
/// 32    status[32]
/// 64    recovery[768]
/// 832   stage[32]
/// 864   slot_suffix[32]      boot-control record
/// 896   reserved[192]
pub const BOOTLOADER_MESSAGE_LEN: usize = 1088;
pub const SLOT_SUFFIX_OFFSET: usize = 864;
pub const SLOT_SUFFIX_LEN: usize = 32;

/// '\0ABB'
pub const BOOT_CTRL_MAGIC: u32 = 0x4242_4100;
pub const BOOT_CONTROL_VERSION: u8 = 1;
/// Serialised size of the record inside the slot_suffix area.
pub const BOOT_CTRL_LEN: usize = 8;

// Slot priority: 15 is preferred, 0 means unbootable. TriesRemaining
// counts boot attempts left for a slot or for recovery.
bounded_integer! {
    pub struct Priority { 0..16 }
}

bounded_integer! {
    pub struct TriesRemaining { 0..8 }
}

/// One slot's metadata, packed into a single byte on flash:
/// priority in bits 0-3, tries_remaining in bits 4-6, successful_boot
/// in bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMetadata {
    priority: Priority,
    tries_remaining: TriesRemaining,
    successful_boot: bool,
}

impl SlotMetadata {
    /// Out-of-range values saturate into their field ranges.
    pub fn new(priority: u8, tries_remaining: u8, successful_boot: bool) -> Self {
        SlotMetadata {
            priority: Priority::new_saturating(priority),
            tries_remaining: TriesRemaining::new_saturating(tries_remaining),
            successful_boot,
        }
    }

    pub fn from_byte(raw: u8) -> Self {
        SlotMetadata {
            priority: Priority::new_saturating(raw & 0x0f),
            tries_remaining: TriesRemaining::new_saturating((raw >> 4) & 0x07),
            successful_boot: raw & 0x80 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.priority() | (self.tries_remaining() << 4) | ((self.successful_boot as u8) << 7)
    }

    pub fn priority(&self) -> u8 {
        self.priority.as_ref().clone()
    }

    pub fn tries_remaining(&self) -> u8 {
        self.tries_remaining.as_ref().clone()
    }

    pub fn successful_boot(&self) -> bool {
        self.successful_boot
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = Priority::new_saturating(priority);
    }

    /// A slot can be attempted while it has priority and either booted
    /// successfully before or has tries left.
    pub fn is_bootable(&self) -> bool {
        self.priority() > 0 && (self.successful_boot || self.tries_remaining() > 0)
    }

    /// All three fields to zero, in one step, so the persisted byte can
    /// never describe a half-failed slot.
    pub fn mark_failed(&mut self) {
        *self = SlotMetadata::new(0, 0, false);
    }

    /// Make this the preferred slot with a fresh try budget. The
    /// successful_boot flag is the OS's to set, not ours.
    pub fn make_active(&mut self) {
        *self = SlotMetadata::new(15, 7, false);
    }

    /// Burn one boot attempt. A slot that has already proven itself
    /// keeps its counter.
    pub fn consume_try(&mut self) {
        if !self.successful_boot && self.tries_remaining() > 0 {
            self.tries_remaining = TriesRemaining::new_saturating(self.tries_remaining() - 1);
        }
    }
}

impl Default for SlotMetadata {
    fn default() -> Self {
        SlotMetadata::new(0, 0, false)
    }
}

/// The boot-control record. Kept as a plain value: read at flow entry,
/// threaded through the selector, written back at each persistence
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootCtrl {
    pub magic: u32,
    pub version: u8,
    pub slot_info: [SlotMetadata; 2],
    recovery_tries_remaining: TriesRemaining,
}

impl Default for BootCtrl {
    fn default() -> Self {
        BootCtrl {
            magic: BOOT_CTRL_MAGIC,
            version: BOOT_CONTROL_VERSION,
            slot_info: [SlotMetadata::default(); 2],
            recovery_tries_remaining: TriesRemaining::new_saturating(0),
        }
    }
}

impl BootCtrl {
    pub fn new(slot_info: [SlotMetadata; 2], recovery_tries: u8) -> Self {
        BootCtrl {
            recovery_tries_remaining: TriesRemaining::new_saturating(recovery_tries),
            slot_info,
            ..BootCtrl::default()
        }
    }

    /// Decode the record from the slot_suffix area. An uninitialised or
    /// corrupted area is not an error: the defaults are returned and
    /// will be written back at the next persistence point.
    pub fn decode(raw: &[u8]) -> BootCtrl {
        if raw.len() < BOOT_CTRL_LEN {
            return BootCtrl::default();
        }
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != BOOT_CTRL_MAGIC {
            log::warn!("A/B selector metadata is not initialised or corrupted, using defaults");
            return BootCtrl::default();
        }
        BootCtrl {
            magic,
            version: raw[4],
            slot_info: [SlotMetadata::from_byte(raw[5]), SlotMetadata::from_byte(raw[6])],
            recovery_tries_remaining: TriesRemaining::new_saturating(raw[7]),
        }
    }

    /// Serialise into a fresh slot_suffix area; the bytes after the
    /// record are zeroed.
    pub fn encode(&self) -> [u8; SLOT_SUFFIX_LEN] {
        let mut out = [0u8; SLOT_SUFFIX_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.version;
        out[5] = self.slot_info[0].to_byte();
        out[6] = self.slot_info[1].to_byte();
        out[7] = self.recovery_tries();
        out
    }

    pub fn recovery_tries(&self) -> u8 {
        self.recovery_tries_remaining.as_ref().clone()
    }

    pub fn set_recovery_tries(&mut self, tries: u8) {
        self.recovery_tries_remaining = TriesRemaining::new_saturating(tries);
    }
}

/// The whole bootloader_message area of the misc partition. Only the
/// slot_suffix field belongs to us; the command/status/recovery/stage
/// fields are owned by the OS and recovery and must round-trip
/// untouched.
#[derive(Debug, Clone)]
pub struct BootloaderMessage {
    raw: [u8; BOOTLOADER_MESSAGE_LEN],
}

impl BootloaderMessage {
    pub fn from_bytes(data: &[u8]) -> Result<BootloaderMessage, BootError> {
        if data.len() < BOOTLOADER_MESSAGE_LEN {
            return Err(BootError::Invalid);
        }
        let mut raw = [0u8; BOOTLOADER_MESSAGE_LEN];
        raw.copy_from_slice(&data[..BOOTLOADER_MESSAGE_LEN]);
        Ok(BootloaderMessage { raw })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn boot_ctrl(&self) -> BootCtrl {
        BootCtrl::decode(&self.raw[SLOT_SUFFIX_OFFSET..SLOT_SUFFIX_OFFSET + SLOT_SUFFIX_LEN])
    }

    pub fn set_boot_ctrl(&mut self, ctrl: &BootCtrl) {
        self.raw[SLOT_SUFFIX_OFFSET..SLOT_SUFFIX_OFFSET + SLOT_SUFFIX_LEN]
            .copy_from_slice(&ctrl.encode());
    }

    /// Read the message area from the start of the misc partition.
    pub fn read_from(
        dev: &mut dyn BlockDevice,
        misc: &PartitionInfo,
    ) -> Result<BootloaderMessage, BootError> {
        let data = read_partition_bytes(dev, misc, 0, BOOTLOADER_MESSAGE_LEN)?;
        BootloaderMessage::from_bytes(&data)
    }

    /// Write the message area back, one block at a time.
    pub fn write_to(&self, dev: &mut dyn BlockDevice, misc: &PartitionInfo) -> Result<(), BootError> {
        write_partition_bytes(dev, misc, 0, &self.raw)
    }
}
