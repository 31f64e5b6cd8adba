//! Shadow topic scheme, device uuid and shadow name substituted.

fn base(uuid: &str, shadow: &str) -> String {
    format!("$iot/device/{uuid}/shadow/name/{shadow}")
}

pub fn update(uuid: &str, shadow: &str) -> String {
    format!("{}/update", base(uuid, shadow))
}

pub fn update_accepted(uuid: &str, shadow: &str) -> String {
    format!("{}/update/accepted", base(uuid, shadow))
}

pub fn update_rejected(uuid: &str, shadow: &str) -> String {
    format!("{}/update/rejected", base(uuid, shadow))
}

pub fn update_delta(uuid: &str, shadow: &str) -> String {
    format!("{}/update/delta", base(uuid, shadow))
}

pub fn get(uuid: &str, shadow: &str) -> String {
    format!("{}/get", base(uuid, shadow))
}

pub fn get_accepted(uuid: &str, shadow: &str) -> String {
    format!("{}/get/accepted", base(uuid, shadow))
}
