use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

/// Parses a timestamp column, tolerating SQLite's type affinity.
///
/// Columns are written as INTEGER milliseconds since the Unix epoch, but
/// rows inserted by hand or by older builds may hold TEXT datetimes, so
/// both forms decode.
pub(crate) fn parse_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<DateTime<Utc>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    if let Ok(timestamp_ms) = row.try_get::<i64, _>(column_name) {
        return DateTime::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| column_decode_error(column_name, "Invalid timestamp value"));
    }

    if let Ok(datetime_str) = row.try_get::<String, _>(column_name) {
        let formats = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
        for format in formats {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&datetime_str, format) {
                return Ok(naive.and_utc());
            }
        }
        return Err(column_decode_error(column_name, "Invalid datetime string"));
    }

    Err(column_decode_error(
        column_name,
        "Could not parse as INTEGER or DATETIME",
    ))
}

/// Parses a TEXT column holding a canonical uuid string.
pub(crate) fn parse_uuid<'r, R>(row: &'r R, column_name: &'r str) -> Result<Uuid, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let raw: String = row.try_get(column_name)?;
    Uuid::parse_str(&raw).map_err(|e| column_decode_error(column_name, &e.to_string()))
}

fn column_decode_error(column_name: &str, message: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())),
    }
}
