//! Bus gateway: MQTT session management, presence and offline buffering.

mod gateway;
mod presence;

pub use gateway::{BusGateway, BusNotice, StoredMessage};
pub use presence::PresenceMap;
