use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use serde::Deserialize;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{BackuparrError, Result};
use crate::postgres::PostgresConfig;

/// ZIP entry that holds the application's settings, including Postgres
/// connection details when the app runs against Postgres.
const CONFIG_XML_ENTRY: &str = "config.xml";

/// Directory inside the artifact where database dumps are spliced in.
const DUMP_PREFIX: &str = "postgres/";

/// Relevant elements of the *arr config.xml. Everything else is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ConfigXml {
    postgres_host: String,
    postgres_port: String,
    postgres_user: String,
    postgres_password: String,
    postgres_main_db: String,
    postgres_log_db: String,
}

/// Extract Postgres connection details from the `config.xml` inside a backup
/// archive. Returns `None` when the app uses its embedded single-file
/// database (empty host). A missing `config.xml` is an error.
pub fn parse_postgres_config(zip_data: &[u8]) -> Result<Option<PostgresConfig>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_data))?;

    let mut entry = archive.by_name(CONFIG_XML_ENTRY).map_err(|_| {
        BackuparrError::Protocol(format!("{CONFIG_XML_ENTRY} not found in backup"))
    })?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;

    let parsed: ConfigXml = quick_xml::de::from_str(&xml)
        .map_err(|e| BackuparrError::Protocol(format!("cannot parse {CONFIG_XML_ENTRY}: {e}")))?;

    if parsed.postgres_host.is_empty() {
        return Ok(None);
    }

    Ok(Some(PostgresConfig {
        host: parsed.postgres_host,
        port: parsed.postgres_port,
        user: parsed.postgres_user,
        password: parsed.postgres_password,
        main_db: parsed.postgres_main_db,
        log_db: parsed.postgres_log_db,
    }))
}

/// Build an enhanced archive: every entry of the original, headers preserved
/// and order intact, followed by one `postgres/<name>` entry per dump.
pub fn enhance_archive(zip_data: &[u8], dumps: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_data))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        writer.raw_copy_file(entry)?;
    }

    for (name, data) in dumps {
        writer.start_file(format!("{DUMP_PREFIX}{name}"), FileOptions::default())?;
        writer.write_all(data)?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

/// Collect the contents of every `postgres/*.sql` entry, keyed by filename
/// without the directory prefix.
pub fn extract_postgres_dumps(zip_data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_data))?;

    let mut dumps = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if !name.starts_with(DUMP_PREFIX) || !name.ends_with(".sql") {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        dumps.insert(name[DUMP_PREFIX.len()..].to_string(), data);
    }
    Ok(dumps)
}
