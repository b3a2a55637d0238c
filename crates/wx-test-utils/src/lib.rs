// wx-test-utils: Shared test utilities for the ingestion suite.
//
// Provides a scripted broker, an in-memory store with fault injection and a
// recording transport handler for integration tests of the ingest service.

pub mod memory_store;
pub mod mock_broker;
pub mod recording_handler;

pub use memory_store::MemoryStore;
pub use mock_broker::MockBroker;
pub use recording_handler::RecordingHandler;

use chrono::{DateTime, TimeZone, Utc};
use wx_reading::{Reading, Station};

/// Reading at `epoch` seconds with fixed sensor values.
pub fn reading_at(epoch: i64) -> Reading {
    Reading {
        timestamp: Utc.timestamp_opt(epoch, 0).single().unwrap_or_default(),
        temperature: 27.4,
        humidity: 81.0,
        pressure: 1009.2,
        radiation: 412.0,
        wind_speed: 3.1,
        wind_direction: 225.0,
        rainfall: 0.0,
    }
}

pub fn at(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_default()
}

/// Broker payload in the station's wire shape.
pub fn station_payload(epoch: i64, temperature: f64) -> Vec<u8> {
    format!(
        r#"{{"Temp":{temperature},"Rh":81,"pressure":1009.2,"radiation":412,"wind.Speed":3.1,"wind.Direction":225,"precipitation":0,"timestamp":{epoch}}}"#
    )
    .into_bytes()
}

pub fn test_station() -> Station {
    Station {
        id: "stn-test".to_owned(),
        name: "Test Rooftop".to_owned(),
        wmo_number: "00000".to_owned(),
        latitude: 13.75,
        longitude: 100.5,
        elevation: 12.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_to_matching_reading() {
        let decoded = wx_reading::decode(&station_payload(1_704_067_200, 27.4)).unwrap();
        assert_eq!(decoded, reading_at(1_704_067_200));
    }
}
