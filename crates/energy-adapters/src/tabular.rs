//! Delimited-text decoding with format auto-detection.
//!
//! Detection order is fixed: compressed CSV (gzip stream or zip archive),
//! plain UTF-8 CSV, then Latin-1 CSV. The first parse that yields enough
//! columns wins.

use std::io::{Cursor, Read};

use energy_core::RawTable;
use flate2::read::GzDecoder;

use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    GzipCsv,
    ZipCsv,
    PlainCsv,
    Latin1Csv,
}

#[derive(Debug, Clone)]
pub struct TabularOptions<'a> {
    pub provider: &'a str,
    pub delimiters: &'a [u8],
    pub min_columns: usize,
}

pub fn decode_tabular(
    bytes: &[u8],
    options: &TabularOptions<'_>,
) -> Result<(RawTable, TabularFormat), AdapterError> {
    if let Some(inner) = gunzip(bytes) {
        if let Ok(table) = decode_text(&inner, options) {
            return Ok((table, TabularFormat::GzipCsv));
        }
    }

    if let Some(inner) = first_zip_entry(bytes) {
        if let Ok(table) = decode_text(&inner, options) {
            return Ok((table, TabularFormat::ZipCsv));
        }
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        if let Ok(table) = parse_delimited(text, options) {
            return Ok((table, TabularFormat::PlainCsv));
        }
    }

    parse_delimited(&latin1(bytes), options).map(|t| (t, TabularFormat::Latin1Csv))
}

fn decode_text(bytes: &[u8], options: &TabularOptions<'_>) -> Result<RawTable, AdapterError> {
    match std::str::from_utf8(bytes) {
        Ok(text) => parse_delimited(text, options),
        Err(_) => parse_delimited(&latin1(bytes), options),
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decompressed body, if `bytes` is a gzip stream.
fn gunzip(bytes: &[u8]) -> Option<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return None;
    }
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).ok()?;
    Some(out)
}

/// First `.csv`/`.txt` member of a zip archive, if `bytes` is one.
fn first_zip_entry(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
    for index in 0..archive.len() {
        let Ok(mut entry) = archive.by_index(index) else {
            continue;
        };
        let name = entry.name().to_ascii_lowercase();
        if !entry.is_file() || !(name.ends_with(".csv") || name.ends_with(".txt")) {
            continue;
        }
        let mut out = Vec::with_capacity(entry.size() as usize);
        if entry.read_to_end(&mut out).is_ok() {
            return Some(out);
        }
    }
    None
}

/// Parse with each candidate delimiter in turn.
pub fn parse_delimited(text: &str, options: &TabularOptions<'_>) -> Result<RawTable, AdapterError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut last_error = format!(
        "no delimiter produced at least {} columns",
        options.min_columns
    );

    for &delimiter in options.delimiters {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(text.as_bytes());

        let headers = match reader.headers() {
            Ok(h) => h.iter().map(|c| c.trim().to_string()).collect::<Vec<_>>(),
            Err(err) => {
                last_error = err.to_string();
                continue;
            }
        };
        if headers.len() < options.min_columns.max(1) {
            continue;
        }

        let mut table = RawTable::new(options.provider, headers);
        let mut failed = false;
        for record in reader.records() {
            match record {
                Ok(record) => table.push_row(record.iter().map(str::to_string).collect()),
                Err(err) => {
                    last_error = err.to_string();
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            return Ok(table);
        }
    }

    Err(AdapterError::Parse(last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const HOUSEHOLD: &str = "Date;Time;Global_active_power;Global_reactive_power;Voltage;Global_intensity;Sub_metering_1;Sub_metering_2;Sub_metering_3\n\
16/12/2006;17:24:00;4.216;0.418;234.840;18.400;0.000;1.000;17.000\n\
16/12/2006;17:25:00;?;?;?;?;?;?;\n";

    fn household_options() -> TabularOptions<'static> {
        TabularOptions {
            provider: "uci_dataset",
            delimiters: b";,\t",
            min_columns: 7,
        }
    }

    #[test]
    fn plain_semicolon_file_is_detected() {
        let (table, format) = decode_tabular(HOUSEHOLD.as_bytes(), &household_options()).unwrap();
        assert_eq!(format, TabularFormat::PlainCsv);
        assert_eq!(table.headers.len(), 9);
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(1, 2), None);
    }

    #[test]
    fn zipped_member_is_preferred() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("household_power_consumption.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(HOUSEHOLD.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        let (table, format) = decode_tabular(buf.get_ref(), &household_options()).unwrap();
        assert_eq!(format, TabularFormat::ZipCsv);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn gzip_stream_is_decompressed_first() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(HOUSEHOLD.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(gz[..2], GZIP_MAGIC);

        let (table, format) = decode_tabular(&gz, &household_options()).unwrap();
        assert_eq!(format, TabularFormat::GzipCsv);
        assert_eq!(table.headers[2], "Global_active_power");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn truncated_gzip_is_not_mistaken_for_text() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(HOUSEHOLD.as_bytes()).unwrap();
        let mut gz = encoder.finish().unwrap();
        gz.truncate(12);
        assert!(decode_tabular(&gz, &household_options()).is_err());
    }

    #[test]
    fn latin1_bytes_fall_back_to_alternate_encoding() {
        let mut bytes = b"utc_timestamp,FR_load_actual_entsoe_transparency,note\n2020-01-01T00:00:00Z,61000,".to_vec();
        bytes.push(0xE9);
        bytes.push(b'\n');
        let options = TabularOptions {
            provider: "opsd",
            delimiters: b",",
            min_columns: 2,
        };
        let (table, format) = decode_tabular(&bytes, &options).unwrap();
        assert_eq!(format, TabularFormat::Latin1Csv);
        assert_eq!(table.rows[0][2], "\u{e9}");
    }

    #[test]
    fn too_few_columns_is_a_parse_failure() {
        let err = decode_tabular(b"a;b\n1;2\n", &household_options()).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }
}
