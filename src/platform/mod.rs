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

pub mod edison;

use crate::error::BootError;
use crate::image::StagedImage;

/// Where the board wants this power cycle to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTarget {
    Normal,
    Recovery,
    Fastboot,
}

/// Everything the boot flow needs from the board. The SCU channel, the
/// USB stack, the reset line and the kernel trampoline all live behind
/// this trait; the flow itself never touches an address directly.
pub trait Platform {
    /// Read one byte from a platform MMIO or scratchpad address.
    fn read_byte(&mut self, addr: u32) -> u8;

    /// Write one byte to a platform MMIO or scratchpad address.
    fn write_byte(&mut self, addr: u32, value: u8);

    /// Issue a raw SCU IPC command with no payload.
    fn ipc_raw(&mut self, cmd: u32, sub: u32) -> Result<(), BootError>;

    /// Re-arm the platform watchdog. Implementations are expected to
    /// rate-limit so the SCU is not flooded.
    fn watchdog_reset(&mut self);

    /// Busy-wait for `ms` milliseconds.
    fn mdelay(&mut self, ms: u32);

    /// Hand execution to the staged kernel. Returns only when the
    /// hand-off failed.
    fn boot_kernel(&mut self, image: &StagedImage) -> BootError;

    /// Enter the host-controlled flashing mode. Returns when the host
    /// session ends.
    fn run_fastboot(&mut self);

    /// Reset the board.
    fn reset(&mut self);

    /// Last resort after reset failed; does not return on hardware.
    fn hang(&mut self);

    /// Where the previous OS asked this power cycle to go. Boards
    /// without a reboot-reason protocol keep the default.
    fn reboot_target(&mut self) -> RebootTarget {
        RebootTarget::Normal
    }

    /// Arrange for the next power cycle to enter fastboot. Boards
    /// without a reboot-reason protocol keep the default.
    fn set_reboot_flag(&mut self) -> Result<(), BootError> {
        Ok(())
    }
}

/// The bootloader environment. Storage is external; only `bootargs`
/// and `serial#` are consumed here.
pub trait Environment {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&mut self, name: &str, value: &str);
    fn unset(&mut self, name: &str);
}
