//! Reading uploaded sheets from delimited text files.
//!
//! - **Delimiter resolution**: `.tsv` reads tab-separated, everything else
//!   comma-separated unless overridden.
//! - **Encoding**: cells are decoded through `encoding_rs`, defaulting to UTF-8.
//! - **Grid shape**: the whole file lands in the sheet grid, header rows
//!   included, so transformation rules can skip leading rows themselves.
//! - **stdin**: the `-` path reads standard input.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8};
use log::debug;

use crate::{
    data::Value,
    fingerprint::{SourceFile, sha256_hex},
    transform::RawSheet,
};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes()).ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

/// Rows may have ragged widths; preamble lines above the header are common.
pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(anyhow!("Failed to decode text with encoding {}", encoding.name()))
    } else {
        Ok(text.into_owned())
    }
}

pub fn decode_record(record: &csv::ByteRecord, encoding: &'static Encoding) -> Result<Vec<String>> {
    record.iter().map(|field| decode_bytes(field, encoding)).collect()
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if is_dash(path) {
        std::io::stdin()
            .lock()
            .read_to_end(&mut bytes)
            .context("Reading standard input")?;
    } else {
        let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
        BufReader::new(file)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Reading input file {path:?}"))?;
    }
    Ok(bytes)
}

/// Parses delimited bytes into a sheet grid. Header cells stay text; blank
/// data cells become nulls.
pub fn parse_sheet(name: &str, bytes: &[u8], delimiter: u8, encoding: &'static Encoding) -> Result<RawSheet> {
    // A UTF-8 byte order mark would otherwise stick to the first header.
    let bytes = if encoding == UTF_8 {
        bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
    } else {
        bytes
    };
    let mut reader = open_csv_reader(bytes, delimiter);
    let mut grid = Vec::new();
    for (idx, record) in reader.byte_records().enumerate() {
        let record = record.with_context(|| format!("Reading record {} of sheet '{name}'", idx + 1))?;
        let cells = decode_record(&record, encoding)
            .with_context(|| format!("Decoding record {} of sheet '{name}'", idx + 1))?;
        grid.push(cells.iter().map(|cell| Value::from_cell(cell)).collect::<Vec<_>>());
    }
    debug!("Read {} line(s) for sheet '{name}'", grid.len());
    Ok(RawSheet::new(name, grid))
}

/// Reads a sheet file and returns it with the SHA-256 of its raw bytes.
pub fn read_sheet(
    name: &str,
    path: &Path,
    delimiter: Option<u8>,
    encoding: &'static Encoding,
) -> Result<(RawSheet, String)> {
    let bytes = read_input(path)?;
    let delimiter = resolve_input_delimiter(path, delimiter);
    let sheet = parse_sheet(name, &bytes, delimiter, encoding)
        .with_context(|| format!("Parsing sheet '{name}' from {path:?}"))?;
    Ok((sheet, sha256_hex(&bytes)))
}

/// Describes the upload as a whole. Several files combine into one name and
/// a hash over their individual hashes, in order.
pub fn source_file(files: &[(String, String)]) -> Option<SourceFile> {
    match files {
        [] => None,
        [(name, sha256)] => Some(SourceFile {
            name: name.clone(),
            sha256: sha256.clone(),
        }),
        many => Some(SourceFile {
            name: many.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join("+"),
            sha256: sha256_hex(
                many.iter()
                    .map(|(_, sha256)| sha256.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
                    .as_bytes(),
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ragged_rows_and_blank_cells() {
        let sheet = parse_sheet(
            "Entries",
            b"\xEF\xBB\xBFExported 2024-03-01\nDate,Amount,Memo\n2024-03-01,10.00,\n2024-03-02,5\n",
            b',',
            UTF_8,
        )
        .unwrap();
        assert_eq!(sheet.grid.len(), 4);
        assert_eq!(sheet.grid[0], vec![Value::from("Exported 2024-03-01")]);
        assert_eq!(sheet.grid[2][2], Value::Null);
        assert_eq!(sheet.grid[3].len(), 2);
    }

    #[test]
    fn decodes_legacy_encodings() {
        let encoding = resolve_encoding(Some("windows-1252")).unwrap();
        let sheet = parse_sheet("Vendors", b"Name\nCaf\xE9\n", b',', encoding).unwrap();
        assert_eq!(sheet.grid[1][0], Value::from("Café"));
        assert!(resolve_encoding(Some("klingon")).is_err());
    }

    #[test]
    fn delimiter_follows_extension() {
        assert_eq!(resolve_input_delimiter(Path::new("a.TSV"), None), b'\t');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), None), b',');
        assert_eq!(resolve_input_delimiter(Path::new("a.tsv"), Some(b';')), b';');
    }

    #[test]
    fn combined_source_file_is_order_sensitive() {
        let a = ("a.csv".to_string(), sha256_hex(b"a"));
        let b = ("b.csv".to_string(), sha256_hex(b"b"));
        assert_eq!(source_file(&[]), None);
        assert_eq!(source_file(std::slice::from_ref(&a)).unwrap().sha256, a.1);
        let ab = source_file(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(ab.name, "a.csv+b.csv");
        assert_ne!(ab.sha256, source_file(&[b, a]).unwrap().sha256);
    }
}
