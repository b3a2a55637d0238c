use crate::status_log::Banner;
use crate::transport::ConnectionState;
use crate::window::WindowUpdate;
use serde::Serialize;

/// Events pushed to status consumers over SSE.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestUiEvent {
    StatusChanged {
        connection_state: ConnectionState,
        subscribed: bool,
    },
    Banner {
        banner: Banner,
    },
    Window {
        update: WindowUpdate,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_log::BannerLevel;

    #[test]
    fn status_changed_serializes_with_type_tag() {
        let event = IngestUiEvent::StatusChanged {
            connection_state: ConnectionState::Connected,
            subscribed: true,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["connection_state"], "connected");
        assert_eq!(json["subscribed"], true);
    }

    #[test]
    fn banner_serializes_with_level() {
        let event = IngestUiEvent::Banner {
            banner: Banner {
                at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
                level: BannerLevel::Warning,
                message: "store unavailable".to_owned(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "banner");
        assert_eq!(json["banner"]["level"], "warning");
        assert_eq!(json["banner"]["message"], "store unavailable");
    }

    #[test]
    fn window_update_nests_its_own_tag() {
        let event = IngestUiEvent::Window {
            update: WindowUpdate::Cleared,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "window");
        assert_eq!(json["update"]["type"], "cleared");
    }
}
