//! Topic construction and filter matching for the device's MQTT namespace.

/// MQTT filter matching with `+` (single level) and `#` (rest) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `device/<uuid>/config/api-key-rotation`
pub fn rotation_topic(uuid: &str) -> String {
    format!("device/{}/config/api-key-rotation", uuid)
}

/// `device/<uuid>/jobs/+`
pub fn jobs_filter(uuid: &str) -> String {
    format!("device/{}/jobs/+", uuid)
}

/// `<base>/logs/<appId>/<serviceName>/<level>`
pub fn log_topic(base: &str, app_id: i64, service_name: &str, level: &str) -> String {
    format!("{}/logs/{}/{}/{}", base, app_id, service_name, level)
}

/// `<base>/sensors/<name>`
pub fn sensor_topic(base: &str, sensor_name: &str) -> String {
    format!("{}/sensors/{}", base, sensor_name)
}
