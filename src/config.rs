pub const HOSTNAME: &str = match option_env!("LUXMETER_HOSTNAME") {
    Some(hostname) => hostname,
    None => "luxmeter1.home",
};
// password used for OTA uploads
pub const OTA_PASSWORD: &str = match option_env!("LUXMETER_OTA_PASSWORD") {
    Some(password) => password,
    None => "admin",
};
pub const WIFI_TIMEOUT_MS: u64 = 30_000;
pub const SERIAL_BAUD_RATE: u32 = 115_200;

pub const DISPLAY_I2C_ADDR: u8 = 0x3C;
pub const LUX_METER_I2C_ADDR: u8 = 0x23;
// the OLED reset line is wired to the built-in LED pin
pub const DISPLAY_RESET_PIN: u8 = 2;

pub const MQTT_MAX_PACKET_SIZE: usize = 512;
pub const MQTT_MAX_RECONNECT_TRIES: u8 = 10;
pub const MQTT_RECONNECT_DELAY_MS: u64 = 5_000;
// send the measured value to the broker every 5 seconds
pub const MQTT_UPDATE_FREQUENCY_MS: u64 = 5_000;
// last topic level; the value goes to sensors/<device name>/lux, which is
// sensors/luxmeter1/lux for the default hostname
pub const MQTT_SENSOR_CHANNEL: &str = "lux";

pub const DISPLAY_UPDATE_FREQUENCY_MS: u64 = 5_000;
pub const LUX_METER_READ_FREQUENCY_MS: u64 = 1_000;

// device resets if the main loop has not run for this long
pub const WATCHDOG_TIMEOUT_SECONDS: u64 = 300;

// capacities of the persisted MQTT fields, without the NUL terminator
pub const MQTT_HOST_CAPACITY: usize = 63;
pub const MQTT_PORT_CAPACITY: usize = 5;
pub const MQTT_USER_CAPACITY: usize = 31;
pub const MQTT_PASS_CAPACITY: usize = 31;
pub const LUX_TEXT_CAPACITY: usize = 11;
