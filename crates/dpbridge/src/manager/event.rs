/// Notifications for host-facing consumers of the aggregated devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Status codes of a device changed, from a report or a local reset.
    StatusUpdated {
        device_id: String,
        codes: Vec<String>,
    },
    /// The device inventory was refreshed and re-merged.
    DevicesRefreshed { device_count: usize },
}
