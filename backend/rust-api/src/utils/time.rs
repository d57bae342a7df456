use chrono::{DateTime, Utc};
use mongodb::bson::DateTime as BsonDateTime;

pub fn chrono_to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

/// Millisecond precision; out-of-range values collapse to the epoch.
pub fn bson_to_chrono(dt: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Truncates to what BSON can hold, so values survive a store round trip unchanged.
pub fn to_millis_precision(dt: DateTime<Utc>) -> DateTime<Utc> {
    bson_to_chrono(chrono_to_bson(dt))
}
