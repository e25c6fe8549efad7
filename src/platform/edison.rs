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

//! Board glue for the Edison module: the reboot-reason scratchpad
//! protocol, the two front buttons and the SCU watchdog commands. All
//! fixed addresses and opcodes live here.

use super::{Platform, RebootTarget};
use crate::error::BootError;

pub const PRODUCT_NAME: &str = "edison";

/// Button status byte. FW on bit 5, RM on bit 6, both active-low.
pub const GPIO_STATUS: u32 = 0xff00_800b;
pub const GPIO_FW: u8 = 0x20;
pub const GPIO_RM: u8 = 0x40;

/// Reboot-reason scratchpad byte and its companion. The pair's sum is
/// kept constant across updates so a torn write can be spotted.
pub const REBOOT_REASON: u32 = 0xffff_f807;
pub const REBOOT_REASON_COMPANION: u32 = 0xffff_f81f;

pub const REASON_RECOVERY: u8 = 0x0c;
pub const REASON_FASTBOOT: u8 = 0x0e;

/// SCU IPC opcode that persists the scratchpad bytes.
pub const IPC_PERSIST_SCRATCHPAD: u32 = 0xe4;

/// SCU watchdog command and its sub-commands.
pub const IPC_WATCHDOG_TIMER: u32 = 0xf8;
pub const WATCHDOG_START: u32 = 0;
pub const WATCHDOG_STOP: u32 = 1;
pub const WATCHDOG_KEEPALIVE: u32 = 2;

/// Seconds between keep-alives; going quiet for much longer than this
/// resets the board.
pub const WATCHDOG_HEARTBEAT_SECS: u32 = 30;

/// Decode the reboot target left behind by the previous OS. The
/// scratchpad byte is cleared on the way out (its value moves into the
/// companion so the sum is preserved) and the clear is persisted over
/// IPC. Holding the FW button forces fastboot before the scratchpad is
/// even looked at.
pub fn reboot_target(p: &mut dyn Platform) -> RebootTarget {
    if p.read_byte(GPIO_STATUS) & GPIO_FW == 0 {
        return RebootTarget::Fastboot;
    }

    let target = p.read_byte(REBOOT_REASON);
    p.write_byte(REBOOT_REASON, 0);
    let companion = p.read_byte(REBOOT_REASON_COMPANION);
    p.write_byte(REBOOT_REASON_COMPANION, companion.wrapping_add(target));

    if p.ipc_raw(IPC_PERSIST_SCRATCHPAD, 0).is_err() {
        log::warn!("cannot persist reboot reason clear");
    }

    match target {
        REASON_RECOVERY => RebootTarget::Recovery,
        REASON_FASTBOOT => RebootTarget::Fastboot,
        _ => RebootTarget::Normal,
    }
}

/// Ask for fastboot on the next power cycle. Invoked for
/// "reboot fastboot".
pub fn set_reboot_flag(p: &mut dyn Platform) -> Result<(), BootError> {
    let previous = p.read_byte(REBOOT_REASON);
    p.write_byte(REBOOT_REASON, REASON_FASTBOOT);
    let companion = p.read_byte(REBOOT_REASON_COMPANION);
    p.write_byte(
        REBOOT_REASON_COMPANION,
        companion.wrapping_add(previous).wrapping_sub(REASON_FASTBOOT),
    );
    p.ipc_raw(IPC_PERSIST_SCRATCHPAD, 0)
}

pub fn watchdog_init(p: &mut dyn Platform) -> Result<(), BootError> {
    p.ipc_raw(IPC_WATCHDOG_TIMER, WATCHDOG_START)
}

pub fn watchdog_disable(p: &mut dyn Platform) -> Result<(), BootError> {
    p.ipc_raw(IPC_WATCHDOG_TIMER, WATCHDOG_STOP)
}

pub fn watchdog_keepalive(p: &mut dyn Platform) -> Result<(), BootError> {
    p.ipc_raw(IPC_WATCHDOG_TIMER, WATCHDOG_KEEPALIVE)
}

pub fn wipe_userdata_message() -> &'static str {
    "Press RM button for YES or FW button for NO"
}

/// Poll the two buttons at 10 Hz for up to 10 seconds. YES means the
/// RM button was seen asserted before FW or the timeout.
pub fn wipe_userdata_confirmed(p: &mut dyn Platform) -> bool {
    let mut retries = 100u32;
    loop {
        let gpio = p.read_byte(GPIO_STATUS);
        let yes = gpio & GPIO_RM == 0;
        let no = gpio & GPIO_FW == 0;
        p.mdelay(100);
        retries -= 1;
        if retries == 0 || yes || no {
            return yes;
        }
    }
}
