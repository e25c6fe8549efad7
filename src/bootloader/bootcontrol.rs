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

//! The A/B slot selector: walks the slots by priority, burns a try per
//! attempt, demotes what fails and escalates to the recovery image and
//! finally fastboot. Also the flasher-facing slot operations.

use crate::blockdev::{BlockDevice, PartitionInfo};
use crate::bootloader::message::{BootCtrl, BootloaderMessage};
use crate::error::BootError;
use crate::gpt;
use crate::image;
use crate::platform::{Environment, Platform, RebootTarget};

pub const SLOT_SUFFIXES: [&str; 2] = ["_a", "_b"];
pub const MISC_PARTITION_NAME: &str = "misc";
const RECOVERY_PARTITION_NAME: &str = "recovery";

const SLOT_SUFFIX_ARG: &str = "androidboot.slot_suffix=";
const SERIALNO_ARG: &str = "androidboot.serialno=";

/// A fresh recovery budget, granted whenever a slot image loads.
const RECOVERY_TRIES: u8 = 7;

/// The first 8 MiB hold the GPT header and the u-boot, factory and
/// security partitions; they get power-on write protection before any
/// slot is attempted.
const WRITE_PROTECT_BYTES: u64 = 8 * 1024 * 1024;

fn suffix_index(suffix: &str) -> Option<usize> {
    SLOT_SUFFIXES.iter().position(|&s| s == suffix)
}

/// Flasher-facing slot operations. Every call reads the record fresh
/// from the misc partition; there is only one control flow alive, so
/// each operation is atomic from the caller's point of view.
pub struct BootControl<'a> {
    dev: &'a mut dyn BlockDevice,
}

impl<'a> BootControl<'a> {
    pub fn new(dev: &'a mut dyn BlockDevice) -> Self {
        BootControl { dev }
    }

    fn read_message(&mut self) -> Result<(PartitionInfo, BootloaderMessage), BootError> {
        let misc = gpt::find_partition(self.dev, MISC_PARTITION_NAME)?;
        let msg = BootloaderMessage::read_from(self.dev, &misc)?;
        Ok((misc, msg))
    }

    /// Make `slot_num` the preferred slot with a full try budget. If
    /// the other slot also sits at top priority it is lowered just
    /// below, so the new choice wins the next ordering.
    pub fn set_active(&mut self, slot_num: usize) -> Result<(), BootError> {
        if slot_num > 1 {
            return Err(BootError::InvalidArgument);
        }
        let (misc, mut msg) = self.read_message()?;
        let mut ctrl = msg.boot_ctrl();

        ctrl.slot_info[slot_num].make_active();
        let other = &mut ctrl.slot_info[slot_num ^ 1];
        if other.priority() == 15 {
            other.set_priority(14);
        }

        msg.set_boot_ctrl(&ctrl);
        msg.write_to(self.dev, &misc)
    }

    /// Suffix of the slot the next boot will try first; ties go to
    /// slot 0.
    pub fn active_slot(&mut self) -> Result<&'static str, BootError> {
        let (_, msg) = self.read_message()?;
        let ctrl = msg.boot_ctrl();
        if ctrl.slot_info[1].priority() > ctrl.slot_info[0].priority() {
            Ok(SLOT_SUFFIXES[1])
        } else {
            Ok(SLOT_SUFFIXES[0])
        }
    }

    pub fn slot_retry_count(&mut self, suffix: &str) -> Result<u8, BootError> {
        let (_, msg) = self.read_message()?;
        let ctrl = msg.boot_ctrl();
        match suffix_index(suffix) {
            Some(i) => Ok(ctrl.slot_info[i].tries_remaining()),
            None => Err(BootError::InvalidArgument),
        }
    }

    pub fn is_successful_slot(&mut self, suffix: &str) -> Result<bool, BootError> {
        let (_, msg) = self.read_message()?;
        let ctrl = msg.boot_ctrl();
        match suffix_index(suffix) {
            Some(i) => Ok(ctrl.slot_info[i].successful_boot()),
            None => Ok(false),
        }
    }

    pub fn is_unbootable_slot(&mut self, suffix: &str) -> Result<bool, BootError> {
        let (_, msg) = self.read_message()?;
        let ctrl = msg.boot_ctrl();
        match suffix_index(suffix) {
            Some(i) => Ok(ctrl.slot_info[i].priority() == 0),
            None => Ok(false),
        }
    }
}

/// One power cycle of the boot state machine.
pub struct BootFlow<'a> {
    dev: &'a mut dyn BlockDevice,
    platform: &'a mut dyn Platform,
    env: &'a mut dyn Environment,
}

impl<'a> BootFlow<'a> {
    pub fn new(
        dev: &'a mut dyn BlockDevice,
        platform: &'a mut dyn Platform,
        env: &'a mut dyn Environment,
    ) -> Self {
        BootFlow { dev, platform, env }
    }

    /// Top-level dispatch. On hardware this hands off to a kernel or
    /// ends in reset/hang; the returned error only satisfies the
    /// command framework.
    pub fn boot_brillo(&mut self) -> BootError {
        match self.platform.reboot_target() {
            RebootTarget::Recovery => {
                self.do_recovery();
            }
            RebootTarget::Fastboot => {
                self.do_fastboot();
                self.do_reset();
                return BootError::NotFound;
            }
            RebootTarget::Normal => {
                self.setup_bootargs();
                if let Err(e) = self.boot_ab() {
                    log::warn!("A/B boot failed: {}", e);
                }
            }
        }

        // Normal and on-disk recovery both failed; fastboot is the
        // diskless recovery.
        self.do_fastboot();
        self.do_reset();
        BootError::NotFound
    }

    /// Seed `bootargs` with the device serial number. Nothing happens
    /// when `serial#` is unset.
    fn setup_bootargs(&mut self) {
        if let Some(serial) = self.env.get("serial#") {
            self.env
                .set("bootargs", &format!("{}{}", SERIALNO_ARG, serial));
        }
    }

    fn do_fastboot(&mut self) {
        log::info!("FASTBOOT MODE...");
        self.platform.run_fastboot();
    }

    fn do_reset(&mut self) {
        self.platform.reset();
        self.platform.hang();
    }

    fn persist(&mut self, msg: &mut BootloaderMessage, ctrl: &BootCtrl, misc: &PartitionInfo) {
        msg.set_boot_ctrl(ctrl);
        if let Err(e) = msg.write_to(self.dev, misc) {
            log::warn!("cannot persist boot metadata: {}", e);
        }
    }

    fn mark_slot_failed(ctrl: &mut BootCtrl, slot_num: usize) {
        ctrl.slot_info[slot_num].mark_failed();
        log::warn!("failed to boot {} slot!", SLOT_SUFFIXES[slot_num]);
    }

    /// Walk the slots in priority order and boot the first one that
    /// loads. Returns only when every slot and the recovery image are
    /// spent.
    pub fn boot_ab(&mut self) -> Result<(), BootError> {
        let misc = gpt::find_partition(self.dev, MISC_PARTITION_NAME)?;
        let mut msg = BootloaderMessage::read_from(self.dev, &misc)?;
        let mut ctrl = msg.boot_ctrl();

        let slots_by_priority: [usize; 2] =
            if ctrl.slot_info[1].priority() > ctrl.slot_info[0].priority() {
                [1, 0]
            } else {
                [0, 1]
            };

        if let Err(e) = self.dev.power_on_write_protect(0, WRITE_PROTECT_BYTES) {
            log::warn!("cannot enable power on write protection: {}", e);
        }

        for &slot_num in slots_by_priority.iter() {
            let slot = ctrl.slot_info[slot_num];
            if !slot.successful_boot() && slot.tries_remaining() == 0 {
                // Out of tries: lower the priority to zero. Persisted
                // with the next metadata write.
                ctrl.slot_info[slot_num].set_priority(0);
                continue;
            }
            if slot.priority() == 0 {
                continue;
            }

            // Previously successful or tries remaining; attempt it.
            let boot_part = format!("boot{}", SLOT_SUFFIXES[slot_num]);
            let staged = match image::load_boot_image(self.dev, self.platform, &boot_part) {
                Ok(staged) => staged,
                Err(_) => {
                    Self::mark_slot_failed(&mut ctrl, slot_num);
                    continue;
                }
            };

            ctrl.slot_info[slot_num].consume_try();
            ctrl.set_recovery_tries(RECOVERY_TRIES);

            let saved_bootargs = self.env.get("bootargs");
            image::append_to_bootargs(self.env, &format!(" {}", SLOT_SUFFIX_ARG));
            image::append_to_bootargs(self.env, SLOT_SUFFIXES[slot_num]);

            self.persist(&mut msg, &ctrl, &misc);
            image::boot_staged_image(self.env, self.platform, &staged);

            // The kernel came back: restore the pre-attempt command
            // line before the failure is persisted.
            match saved_bootargs {
                Some(v) => self.env.set("bootargs", &v),
                None => self.env.unset("bootargs"),
            }
            Self::mark_slot_failed(&mut ctrl, slot_num);
            self.persist(&mut msg, &ctrl, &misc);
        }

        // No slot booted. Try recovery.
        self.boot_recovery_image(&mut msg, &mut ctrl, &misc);

        Err(BootError::NotFound)
    }

    /// Boot the recovery image while its budget lasts. Every budget
    /// transition is persisted before the next step.
    fn boot_recovery_image(
        &mut self,
        msg: &mut BootloaderMessage,
        ctrl: &mut BootCtrl,
        misc: &PartitionInfo,
    ) {
        if ctrl.recovery_tries() == 0 {
            return;
        }
        ctrl.set_recovery_tries(ctrl.recovery_tries() - 1);

        let staged = match image::load_boot_image(self.dev, self.platform, RECOVERY_PARTITION_NAME)
        {
            Ok(staged) => staged,
            Err(_) => {
                ctrl.set_recovery_tries(0);
                self.persist(msg, ctrl, misc);
                return;
            }
        };

        self.persist(msg, ctrl, misc);
        image::boot_staged_image(self.env, self.platform, &staged);

        // Recovery came back as well; burn the whole budget.
        ctrl.set_recovery_tries(0);
        self.persist(msg, ctrl, misc);
    }

    /// Explicit recovery entry, taken when the previous OS asked for
    /// it. The slots are marked failed before recovery runs so a later
    /// normal boot cannot resurrect them behind recovery's back.
    pub fn do_recovery(&mut self) {
        let misc = match gpt::find_partition(self.dev, MISC_PARTITION_NAME) {
            Ok(part) => part,
            Err(_) => return,
        };
        let mut msg = match BootloaderMessage::read_from(self.dev, &misc) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let mut ctrl = msg.boot_ctrl();

        for slot in ctrl.slot_info.iter_mut() {
            slot.mark_failed();
        }

        self.boot_recovery_image(&mut msg, &mut ctrl, &misc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::message::SlotMetadata;
    use crate::testutil::{
        catch_kernel_entry, corrupt_partition, read_boot_ctrl, seed_boot_ctrl, standard_disk,
        valid_image, BootImage, MockEnv, MockPlatform,
    };

    fn healthy_images(dev: &mut crate::testutil::RamBlockDevice) {
        valid_image("boot_a").write_to(dev, "boot_a");
        valid_image("boot_b").write_to(dev, "boot_b");
        valid_image("recovery").write_to(dev, "recovery");
    }

    // Fresh device, zeroed misc. Both slots skip, recovery budget
    // is zero, flow falls through to fastboot.
    #[test]
    fn fresh_device_falls_to_fastboot() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        let mut platform = MockPlatform::new();
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_none());

        assert!(platform.boot_attempts.is_empty());
        assert_eq!(platform.fastboot_runs, 1);
        assert_eq!(platform.resets, 1);
        assert_eq!(platform.hangs, 1);

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl, BootCtrl::default());
    }

    // Both slots healthy, A preferred. The proven slot keeps its
    // try counter and the suffix lands on the command line.
    #[test]
    fn healthy_slot_a_boots_first() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(14, 7, true)],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();
        env.set("serial#", "e1d150n");

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_some());

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(15, 7, true));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(14, 7, true));
        assert_eq!(ctrl.recovery_tries(), 7);

        let bootargs = env.get("bootargs").unwrap();
        assert!(bootargs.starts_with("console=ttyS0"));
        assert!(bootargs.contains("androidboot.serialno=e1d150n"));
        assert!(bootargs.ends_with("androidboot.slot_suffix=_a"));
    }

    // Slot A does not load; B is attempted with one try burned.
    #[test]
    fn corrupt_slot_a_falls_to_b() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        corrupt_partition(&mut dev, "boot_a");
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [
                    SlotMetadata::new(15, 3, false),
                    SlotMetadata::new(10, 5, false),
                ],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_some());

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(10, 4, false));
        assert_eq!(ctrl.recovery_tries(), 7);
        assert!(env.get("bootargs").unwrap().ends_with("androidboot.slot_suffix=_b"));
        assert_eq!(platform.boot_attempts, vec!["boot_b".to_string()]);
    }

    // Both slots exhausted; recovery boots on a decremented budget
    // and the demotions are persisted alongside it.
    #[test]
    fn exhausted_slots_enter_recovery() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [
                    SlotMetadata::new(15, 0, false),
                    SlotMetadata::new(15, 0, false),
                ],
                3,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_some());
        assert_eq!(platform.boot_attempts, vec!["recovery".to_string()]);

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.recovery_tries(), 2);
    }

    // Explicit recovery request with a recovery image that fails to
    // load. The budget is burned and fastboot is entered.
    #[test]
    fn explicit_recovery_with_bad_image() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        corrupt_partition(&mut dev, "recovery");
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(14, 7, true)],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.target = RebootTarget::Recovery;
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_none());

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.recovery_tries(), 0);
        assert_eq!(platform.fastboot_runs, 1);
        assert!(platform.boot_attempts.is_empty());
    }

    // A hand-off that returns demotes the slot and restores bootargs
    // before the failure is persisted.
    #[test]
    fn returned_handoff_demotes_and_restores_bootargs() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        corrupt_partition(&mut dev, "recovery");
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [
                    SlotMetadata::new(15, 3, false),
                    SlotMetadata::new(0, 0, false),
                ],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        let mut env = MockEnv::new();
        env.set("bootargs", "androidboot.serialno=0000");

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_none());
        assert_eq!(platform.boot_attempts, vec!["boot_a".to_string()]);

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
        // the persisted failure does not carry the attempt's cmdline
        assert_eq!(env.get("bootargs").unwrap(), "androidboot.serialno=0000");
        assert_eq!(platform.fastboot_runs, 1);
    }

    // The arbitrator saying fastboot bypasses the selector entirely.
    #[test]
    fn fastboot_target_skips_selector() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(14, 7, true)],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.target = RebootTarget::Fastboot;
        let mut env = MockEnv::new();

        let err = BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo();
        assert_eq!(err, BootError::NotFound);
        assert!(platform.boot_attempts.is_empty());
        assert_eq!(platform.fastboot_runs, 1);
        assert_eq!(platform.resets, 1);
        // untouched metadata
        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(15, 7, true));
    }

    // The write-protect arming covers the layout prefix and failure to
    // arm does not stop the boot.
    #[test]
    fn write_protection_is_armed_first() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(0, 0, false)],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();

        catch_kernel_entry(|| BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo());
        assert_eq!(dev.wp_ranges, vec![(0, 8 * 1024 * 1024)]);
    }

    // set_active on the non-preferred slot flips the ordering.
    #[test]
    fn set_active_flips_preference() {
        let mut dev = standard_disk();
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(10, 0, true)],
                7,
            ),
        );

        BootControl::new(&mut dev).set_active(1).unwrap();

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(14, 7, true));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(15, 7, false));
        assert_eq!(ctrl.recovery_tries(), 7);
    }

    #[test]
    fn set_active_rejects_bad_slot() {
        let mut dev = standard_disk();
        assert_eq!(
            BootControl::new(&mut dev).set_active(2).unwrap_err(),
            BootError::InvalidArgument
        );
    }

    #[test]
    fn query_operations() {
        let mut dev = standard_disk();
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(10, 3, true), SlotMetadata::new(15, 5, false)],
                7,
            ),
        );
        let mut bc = BootControl::new(&mut dev);

        assert_eq!(bc.active_slot().unwrap(), "_b");
        assert_eq!(bc.slot_retry_count("_a").unwrap(), 3);
        assert_eq!(bc.slot_retry_count("_b").unwrap(), 5);
        assert_eq!(
            bc.slot_retry_count("_c").unwrap_err(),
            BootError::InvalidArgument
        );
        assert!(bc.is_successful_slot("_a").unwrap());
        assert!(!bc.is_successful_slot("_b").unwrap());
        assert!(!bc.is_successful_slot("_c").unwrap());
        assert!(!bc.is_unbootable_slot("_a").unwrap());
        assert!(!bc.is_unbootable_slot("_b").unwrap());
    }

    #[test]
    fn active_slot_tie_favours_a() {
        let mut dev = standard_disk();
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 7, true), SlotMetadata::new(15, 7, true)],
                7,
            ),
        );
        assert_eq!(BootControl::new(&mut dev).active_slot().unwrap(), "_a");
    }

    #[test]
    fn unbootable_query_sees_demoted_slot() {
        let mut dev = standard_disk();
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(0, 0, false), SlotMetadata::new(15, 7, true)],
                7,
            ),
        );
        let mut bc = BootControl::new(&mut dev);
        assert!(bc.is_unbootable_slot("_a").unwrap());
        assert!(!bc.is_unbootable_slot("_b").unwrap());
    }

    // Metadata writes during the flow never exceed one block per call.
    #[test]
    fn metadata_writes_are_block_granular() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 3, false), SlotMetadata::new(0, 0, false)],
                7,
            ),
        );
        let mut platform = MockPlatform::new();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();

        dev.write_log.clear();
        catch_kernel_entry(|| BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo());
        assert!(!dev.write_log.is_empty());
        assert!(dev.write_log.iter().all(|&(_, count)| count == 1));
    }

    // One full degradation chain: A fails to load, B's kernel returns,
    // recovery loads and boots.
    #[test]
    fn degradation_chain_reaches_recovery() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        corrupt_partition(&mut dev, "boot_a");
        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [
                    SlotMetadata::new(15, 3, false),
                    SlotMetadata::new(10, 5, false),
                ],
                5,
            ),
        );
        let mut platform = MockPlatform::new();
        // first boot_kernel call (slot B) returns, second (recovery) enters
        platform.fail_kernel_next();
        platform.enter_kernel_next();
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_some());
        assert_eq!(
            platform.boot_attempts,
            vec!["boot_b".to_string(), "recovery".to_string()]
        );

        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
        assert_eq!(ctrl.slot_info[1], SlotMetadata::new(0, 0, false));
        // slot B's load refreshed the budget; recovery consumed one try
        assert_eq!(ctrl.recovery_tries(), 6);
    }

    // A boot image too large for the staging window is a load failure,
    // not a crash.
    #[test]
    fn oversized_image_demotes_slot() {
        let mut dev = standard_disk();
        healthy_images(&mut dev);
        let big = BootImage::minimal("boot_a");
        big.write_to(&mut dev, "boot_a");
        // rewrite the header with an absurd kernel size
        let part = gpt::find_partition(&mut dev, "boot_a").unwrap();
        let mut head =
            crate::blockdev::read_partition_bytes(&mut dev, &part, 0, 2048).unwrap();
        head[8..12].copy_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());
        crate::blockdev::write_partition_bytes(&mut dev, &part, 0, &head).unwrap();

        seed_boot_ctrl(
            &mut dev,
            &BootCtrl::new(
                [SlotMetadata::new(15, 3, false), SlotMetadata::new(0, 0, false)],
                0,
            ),
        );
        let mut platform = MockPlatform::new();
        let mut env = MockEnv::new();

        let entered = catch_kernel_entry(|| {
            BootFlow::new(&mut dev, &mut platform, &mut env).boot_brillo()
        });
        assert!(entered.is_none());
        assert!(platform.boot_attempts.is_empty());
        let ctrl = read_boot_ctrl(&mut dev);
        assert_eq!(ctrl.slot_info[0], SlotMetadata::new(0, 0, false));
    }
}
