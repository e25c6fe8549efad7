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

//! The security partition: device lock state and the verified-boot
//! device key, maintained for the flasher. Every modifier is a
//! read-modify-write of the whole record.

use crate::blockdev::{read_partition_bytes, write_partition_bytes, BlockDevice};
use crate::error::BootError;
use crate::gpt;

pub const SECURITY_PARTITION_NAME: &str = "security";

/// Capacity of the device key field.
pub const BVB_DEVKEY_MAX: usize = 2048;

/// lock byte, devkey, then reserved padding out to five blocks.
pub const SECURITY_FLAGS_LEN: usize = 2560;
const DEVKEY_OFFSET: usize = 1;

#[derive(Clone)]
pub struct SecurityFlags {
    pub lock: u8,
    pub devkey: [u8; BVB_DEVKEY_MAX],
}

impl Default for SecurityFlags {
    fn default() -> Self {
        SecurityFlags {
            lock: 0,
            devkey: [0u8; BVB_DEVKEY_MAX],
        }
    }
}

impl SecurityFlags {
    pub fn from_bytes(raw: &[u8]) -> Result<SecurityFlags, BootError> {
        if raw.len() < SECURITY_FLAGS_LEN {
            return Err(BootError::Invalid);
        }
        let mut devkey = [0u8; BVB_DEVKEY_MAX];
        devkey.copy_from_slice(&raw[DEVKEY_OFFSET..DEVKEY_OFFSET + BVB_DEVKEY_MAX]);
        Ok(SecurityFlags {
            lock: raw[0],
            devkey,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; SECURITY_FLAGS_LEN];
        out[0] = self.lock;
        out[DEVKEY_OFFSET..DEVKEY_OFFSET + BVB_DEVKEY_MAX].copy_from_slice(&self.devkey);
        out
    }
}

fn read_security_partition(dev: &mut dyn BlockDevice) -> Result<SecurityFlags, BootError> {
    let part = gpt::find_partition(dev, SECURITY_PARTITION_NAME)?;
    let raw = read_partition_bytes(dev, &part, 0, SECURITY_FLAGS_LEN)?;
    SecurityFlags::from_bytes(&raw)
}

fn write_security_partition(
    dev: &mut dyn BlockDevice,
    flags: &SecurityFlags,
) -> Result<(), BootError> {
    let part = gpt::find_partition(dev, SECURITY_PARTITION_NAME)?;
    write_partition_bytes(dev, &part, 0, &flags.to_bytes())
}

pub fn read_lock_state(dev: &mut dyn BlockDevice) -> Result<u8, BootError> {
    Ok(read_security_partition(dev)?.lock)
}

pub fn write_lock_state(dev: &mut dyn BlockDevice, lock: u8) -> Result<(), BootError> {
    let mut flags = read_security_partition(dev)?;
    flags.lock = lock;
    write_security_partition(dev, &flags)
}

pub fn read_dev_key(dev: &mut dyn BlockDevice) -> Result<[u8; BVB_DEVKEY_MAX], BootError> {
    Ok(read_security_partition(dev)?.devkey)
}

/// Overwrite the front of the device key field; the remainder keeps
/// its previous content, as the field is fixed-size on flash.
pub fn write_dev_key(dev: &mut dyn BlockDevice, key: &[u8]) -> Result<(), BootError> {
    if key.len() > BVB_DEVKEY_MAX {
        log::error!("key size is bigger than {}", BVB_DEVKEY_MAX);
        return Err(BootError::OutOfMemory);
    }
    let mut flags = read_security_partition(dev)?;
    flags.devkey[..key.len()].copy_from_slice(key);
    log::debug!(
        "device key updated, fingerprint {}",
        hex::encode(&flags.devkey[..8])
    );
    write_security_partition(dev, &flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::standard_disk;

    #[test]
    fn lock_state_round_trip() {
        let mut dev = standard_disk();
        assert_eq!(read_lock_state(&mut dev).unwrap(), 0);
        write_lock_state(&mut dev, 1).unwrap();
        assert_eq!(read_lock_state(&mut dev).unwrap(), 1);
    }

    #[test]
    fn modifiers_touch_only_their_field() {
        let mut dev = standard_disk();
        let key = [0xabu8; 64];
        write_dev_key(&mut dev, &key).unwrap();
        write_lock_state(&mut dev, 1).unwrap();

        // the lock write did not clobber the key
        let back = read_dev_key(&mut dev).unwrap();
        assert_eq!(&back[..64], &key[..]);
        assert!(back[64..].iter().all(|&b| b == 0));
        assert_eq!(read_lock_state(&mut dev).unwrap(), 1);

        // a shorter key only overwrites the front of the field
        write_dev_key(&mut dev, &[0x11u8; 16]).unwrap();
        let back = read_dev_key(&mut dev).unwrap();
        assert_eq!(&back[..16], &[0x11u8; 16][..]);
        assert_eq!(&back[16..64], &key[16..]);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let mut dev = standard_disk();
        let key = vec![0u8; BVB_DEVKEY_MAX + 1];
        assert_eq!(
            write_dev_key(&mut dev, &key).unwrap_err(),
            BootError::OutOfMemory
        );
    }

    #[test]
    fn security_writes_are_single_block() {
        let mut dev = standard_disk();
        dev.write_log.clear();
        write_lock_state(&mut dev, 1).unwrap();
        assert_eq!(dev.write_log.len(), SECURITY_FLAGS_LEN / 512);
        assert!(dev.write_log.iter().all(|&(_, count)| count == 1));
    }
}
