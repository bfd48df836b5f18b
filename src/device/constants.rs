use uuid::{uuid, Uuid};

/**
 * The advertised local name of the ESP32 firmware.
 */
pub const DEVICE_NAME: &str = "ESP32_BLE";

/**
 * How long (milliseconds) to wait after a link drop before reconnecting.
 */
pub const RECONNECT_DELAY: u64 = 1000;

/**
 * How long (milliseconds) a write to the command characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How many timestamp notifications are kept for display (15 rows of 2 columns).
 */
pub const HISTORY_CAPACITY: usize = 30;

/**
 * Upper bound for a configured history capacity.
 */
pub const MAX_HISTORY_CAPACITY: usize = 1024;

/**
 * The UUID of the primary service of the firmware.
 */
pub const SERVICE_UUID: Uuid = uuid!("4fafc201-1fb5-459e-8fcc-c5c9c331914b");

/**
 * The UUID of the characteristic that accepts text commands such as `get/button1/1-30`.
 */
pub const COMMAND_CHARACTERISTIC_UUID: Uuid = uuid!("beefcafe-36e1-4688-b7f5-00000000000b");

/**
 * Notify characteristic for button 1 events.
 */
pub const BUTTON1_CHARACTERISTIC_UUID: Uuid = uuid!("deadbeef-36e1-4688-b7f5-000000000001");

/**
 * Notify characteristic for button 2 events.
 */
pub const BUTTON2_CHARACTERISTIC_UUID: Uuid = uuid!("cafebeef-36e1-4688-b7f5-000000000002");

pub fn default_notify_characteristics() -> Vec<Uuid> {
    vec![BUTTON1_CHARACTERISTIC_UUID, BUTTON2_CHARACTERISTIC_UUID]
}
