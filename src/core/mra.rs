//! Reader for MiSTer `.mra` arcade descriptions

use crate::db::GameMetadata;
use crate::error::SyncError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::path::Path;

/// Fields of an MRA the catalog builder needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MraInfo {
    pub name: Option<String>,
    pub setname: Option<String>,
    /// Core name without date or extension, e.g. `jt1942`
    pub rbf: Option<String>,
    /// ROM archives referenced by `<rom zip="a.zip|b.zip">`, in order, deduplicated
    pub rom_zips: Vec<String>,
    pub manufacturer: Option<String>,
    pub year: Option<String>,
    pub category: Option<String>,
    pub players: Option<String>,
    pub rotation: Option<String>,
    pub region: Option<String>,
}

impl MraInfo {
    /// Game fields as read from the MRA, used when the metadata table has no match
    pub fn metadata(&self) -> GameMetadata {
        GameMetadata {
            name: self.name.clone(),
            setname: self.setname.clone(),
            manufacturer: self.manufacturer.clone(),
            year: self.year.clone(),
            category: self.category.clone(),
            players: self.players.clone(),
            controls: None,
            rotation: self.rotation.clone(),
            region: self.region.clone(),
        }
    }
}

fn xml_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::format(format!("invalid MRA: {}", e))
}

fn collect_rom_zips(e: &BytesStart<'_>, info: &mut MraInfo) -> Result<(), SyncError> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_ref() != b"zip" {
            continue;
        }
        let value = String::from_utf8_lossy(&attr.value).to_string();
        for zip in value.split('|').map(str::trim).filter(|z| !z.is_empty()) {
            if !info.rom_zips.iter().any(|z| z.eq_ignore_ascii_case(zip)) {
                info.rom_zips.push(zip.to_string());
            }
        }
    }
    Ok(())
}

pub fn parse_mra(xml: &str) -> Result<MraInfo, SyncError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut info = MraInfo::default();
    let mut depth = 0usize;
    let mut current_tag = String::new();
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => {
                depth += 1;
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                if depth == 1 {
                    saw_root = tag == "misterromdescription";
                } else if tag == "rom" {
                    collect_rom_zips(e, &mut info)?;
                }
                current_tag = tag;
            }
            Event::Empty(ref e) => {
                if e.name().as_ref().eq_ignore_ascii_case(b"rom") {
                    collect_rom_zips(e, &mut info)?;
                }
            }
            Event::Text(ref e) => {
                // only direct children of the root carry game fields
                if depth != 2 {
                    continue;
                }
                let text = e.unescape().map_err(xml_error)?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let slot = match current_tag.as_str() {
                    "name" => &mut info.name,
                    "setname" => &mut info.setname,
                    "rbf" => &mut info.rbf,
                    "manufacturer" => &mut info.manufacturer,
                    "year" => &mut info.year,
                    "category" => &mut info.category,
                    "players" => &mut info.players,
                    "rotation" => &mut info.rotation,
                    "region" => &mut info.region,
                    _ => continue,
                };
                slot.get_or_insert(text);
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                current_tag.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(SyncError::format("missing <misterromdescription> root"));
    }
    if let Some(rbf) = info.rbf.take() {
        info.rbf = Some(normalize_rbf(&rbf));
    }
    Ok(info)
}

/// Read and parse an MRA from disk
pub async fn read_mra(path: &Path) -> Result<MraInfo, SyncError> {
    let content = tokio::fs::read(path).await?;
    parse_mra(&String::from_utf8_lossy(&content))
}

/// `jt1942_20230101.rbf` and `JT1942` both become `jt1942`
pub fn normalize_rbf(rbf: &str) -> String {
    let stem = rbf
        .rsplit('/')
        .next()
        .unwrap_or(rbf)
        .trim_end_matches(".rbf")
        .to_lowercase();
    match stem.rsplit_once('_') {
        Some((base, date)) if crate::core::classifier::parse_filename_date(date).is_some() => {
            base.to_string()
        }
        _ => stem,
    }
}
