//! Capture time from EXIF, for items whose album page carried none.

use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

/// Read `DateTimeOriginal` from an image container.
///
/// Returns `None` when the data has no EXIF block, the tag is missing or
/// the value is not a valid date. EXIF times without an offset are taken
/// as UTC.
pub fn capture_time<R: BufRead + Seek>(reader: &mut R) -> Option<DateTime<Utc>> {
    let exif_data = match exif::Reader::new().read_from_container(reader) {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!(error = %e, "No EXIF data");
            return None;
        }
    };
    let field = exif_data.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)?;
    let raw = match &field.value {
        exif::Value::Ascii(values) => values.first()?,
        _ => return None,
    };
    let parsed = exif::DateTime::from_ascii(raw).ok()?;
    to_utc(&parsed)
}

/// [`capture_time`] over an in-memory payload.
pub fn capture_time_from_bytes(data: &[u8]) -> Option<DateTime<Utc>> {
    capture_time(&mut Cursor::new(data))
}

/// [`capture_time`] over a file on disk; I/O errors read as "no time".
pub fn capture_time_from_file(path: &Path) -> Option<DateTime<Utc>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot open file for EXIF");
            return None;
        }
    };
    capture_time(&mut BufReader::new(file))
}

fn to_utc(dt: &exif::DateTime) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(dt.year.into(), dt.month.into(), dt.day.into())?
        .and_hms_opt(dt.hour.into(), dt.minute.into(), dt.second.into())?;
    match dt.offset {
        Some(minutes) => FixedOffset::east_opt(i32::from(minutes) * 60)?
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc)),
        None => Some(Utc.from_utc_datetime(&naive)),
    }
}

/// A minimal JPEG whose only metadata is `DateTimeOriginal = value`.
#[cfg(test)]
pub(crate) fn jpeg_with_capture_time(value: &str) -> Vec<u8> {
    assert_eq!(value.len(), 19, "EXIF datetime is YYYY:MM:DD HH:MM:SS");
    let mut tiff: Vec<u8> = Vec::new();
    // Big-endian TIFF header, IFD0 at offset 8.
    tiff.extend_from_slice(b"MM\x00\x2a\x00\x00\x00\x08");
    // IFD0: one entry pointing at the Exif IFD (offset 26).
    tiff.extend_from_slice(&[0x00, 0x01]);
    tiff.extend_from_slice(&[0x87, 0x69, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]);
    tiff.extend_from_slice(&26u32.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());
    // Exif IFD: DateTimeOriginal, ASCII, 20 bytes at offset 44.
    tiff.extend_from_slice(&[0x00, 0x01]);
    tiff.extend_from_slice(&[0x90, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, 0x14]);
    tiff.extend_from_slice(&44u32.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());
    tiff.extend_from_slice(value.as_bytes());
    tiff.push(0);

    let segment_len = (2 + 6 + tiff.len()) as u16;
    let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
    jpeg.extend_from_slice(&segment_len.to_be_bytes());
    jpeg.extend_from_slice(b"Exif\x00\x00");
    jpeg.extend_from_slice(&tiff);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_date_time_original() {
        let jpeg = jpeg_with_capture_time("2019:05:06 07:08:09");
        let time = capture_time_from_bytes(&jpeg).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2019, 5, 6, 7, 8, 9).unwrap());
    }

    #[test]
    fn test_reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, jpeg_with_capture_time("2001:02:03 04:05:06")).unwrap();
        assert_eq!(
            capture_time_from_file(&path),
            Some(Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap())
        );
    }

    #[test]
    fn test_no_exif_is_none() {
        assert_eq!(capture_time_from_bytes(b"not an image"), None);
        assert_eq!(capture_time_from_file(Path::new("/nonexistent/x.jpg")), None);
    }

    #[test]
    fn test_invalid_date_is_none() {
        let jpeg = jpeg_with_capture_time("2019:13:40 07:08:09");
        assert_eq!(capture_time_from_bytes(&jpeg), None);
    }
}
