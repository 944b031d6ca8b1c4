pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

pub const TOPIC_PREFIX: &str = "porssari";

pub fn channel_topic(device_id: &str, channel: usize) -> String {
    format!("{TOPIC_PREFIX}/{device_id}/channel/{channel}/set")
}

pub fn status_topic(device_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{device_id}/status")
}
