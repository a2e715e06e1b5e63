//! Drawing-layer access to xlsx archives.
//!
//! calamine covers cell data but not the drawing parts, so embedded pictures
//! and their anchors are read straight from the archive:
//! `xl/drawings/drawingN.xml` holds the anchors, its `_rels` part maps blip
//! references to `xl/media/*`, and `xl/worksheets/sheet1.xml` carries the
//! manual row breaks used for page-range derivation.
//!
//! Anchor rows/cols are converted to 1-based to match spreadsheet coordinates.

use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::models::{Anchor, AnchorType, EMU_PER_INCH};
use crate::utils::{ApiError, ApiResult};

/// Rows per inch assumed when a one-cell anchor only carries a pixel extent
const APPROX_ROWS_PER_INCH: f64 = 15.0;

/// One embedded picture: anchor geometry plus raw image bytes
#[derive(Debug, Clone)]
pub struct DrawingImage {
    pub anchor: Anchor,
    pub data: Vec<u8>,
}

/// Read all embedded pictures with their anchors, in document order.
pub fn read_drawing_images(path: &Path) -> ApiResult<Vec<DrawingImage>> {
    let file_name = path.display().to_string();
    let file = std::fs::File::open(path)
        .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;

    let mut drawing_parts: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/drawings/drawing") && name.ends_with(".xml"))
        .map(|name| name.to_string())
        .collect();
    drawing_parts.sort();

    let mut images = Vec::new();
    for part in drawing_parts {
        let xml = read_archive_text(&mut archive, &part, &file_name)?;
        let anchors = parse_anchors(&xml)
            .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;

        let rels_part = rels_part_for(&part);
        let rels = match read_archive_text(&mut archive, &rels_part, &file_name) {
            Ok(rels_xml) => parse_relationships(&rels_xml)
                .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?,
            Err(_) => HashMap::new(),
        };

        for parsed in anchors {
            let Some(rel_id) = parsed.rel_id else {
                continue;
            };
            let Some(target) = rels.get(&rel_id) else {
                tracing::warn!("Drawing relationship {} has no target, skipping image", rel_id);
                continue;
            };
            let media_part = resolve_media_target(target);
            match read_archive_bytes(&mut archive, &media_part, &file_name) {
                Ok(data) => images.push(DrawingImage { anchor: parsed.anchor, data }),
                Err(e) => {
                    tracing::warn!("Failed to read media part {}: {}", media_part, e);
                }
            }
        }
    }

    Ok(images)
}

/// Manual row breaks of the first worksheet, 1-based, sorted and deduped.
pub fn read_row_breaks(path: &Path) -> ApiResult<Vec<u32>> {
    let file_name = path.display().to_string();
    let file = std::fs::File::open(path)
        .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;

    let xml = match read_archive_text(&mut archive, "xl/worksheets/sheet1.xml", &file_name) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut in_row_breaks = false;
    let mut breaks = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"rowBreaks" => {
                in_row_breaks = true;
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"rowBreaks" => {
                in_row_breaks = false;
            }
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if in_row_breaks && e.local_name().as_ref() == b"brk" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"id"
                        && let Ok(value) = attr.unescape_value()
                        && let Ok(row) = value.parse::<u32>()
                    {
                        breaks.push(row);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ApiError::extraction_failed(&file_name, e.to_string()));
            }
            _ => {}
        }
    }

    breaks.sort_unstable();
    breaks.dedup();
    Ok(breaks)
}

// ============================================================================
// Archive helpers
// ============================================================================

fn read_archive_text(
    archive: &mut zip::ZipArchive<std::fs::File>,
    part: &str,
    file_name: &str,
) -> ApiResult<String> {
    let mut entry = archive
        .by_name(part)
        .map_err(|e| ApiError::extraction_failed(file_name, format!("{}: {}", part, e)))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| ApiError::extraction_failed(file_name, e.to_string()))?;
    Ok(content)
}

fn read_archive_bytes(
    archive: &mut zip::ZipArchive<std::fs::File>,
    part: &str,
    file_name: &str,
) -> ApiResult<Vec<u8>> {
    let mut entry = archive
        .by_name(part)
        .map_err(|e| ApiError::extraction_failed(file_name, format!("{}: {}", part, e)))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|e| ApiError::extraction_failed(file_name, e.to_string()))?;
    Ok(data)
}

fn rels_part_for(drawing_part: &str) -> String {
    // xl/drawings/drawing1.xml -> xl/drawings/_rels/drawing1.xml.rels
    match drawing_part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", drawing_part),
    }
}

fn resolve_media_target(target: &str) -> String {
    // Targets are relative to xl/drawings/, e.g. "../media/image1.png"
    let trimmed = target.trim_start_matches("../");
    format!("xl/{}", trimmed)
}

// ============================================================================
// XML parsing
// ============================================================================

struct ParsedAnchor {
    anchor: Anchor,
    rel_id: Option<String>,
}

#[derive(PartialEq)]
enum Corner {
    None,
    From,
    To,
}

fn parse_anchors(xml: &str) -> Result<Vec<ParsedAnchor>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut anchors = Vec::new();
    let mut current: Option<ParsedAnchor> = None;
    let mut corner = Corner::None;
    let mut pending_field: Option<&'static str> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"twoCellAnchor" => {
                        current = Some(ParsedAnchor {
                            anchor: Anchor { anchor_type: AnchorType::TwoCell, ..Anchor::default() },
                            rel_id: None,
                        });
                    }
                    b"oneCellAnchor" | b"absoluteAnchor" => {
                        current = Some(ParsedAnchor {
                            anchor: Anchor { anchor_type: AnchorType::OneCell, ..Anchor::default() },
                            rel_id: None,
                        });
                    }
                    b"from" => corner = Corner::From,
                    b"to" => corner = Corner::To,
                    b"ext" => {
                        if let Some(parsed) = current.as_mut() {
                            for attr in e.attributes().flatten() {
                                let value = match attr.unescape_value() {
                                    Ok(v) => v.parse::<i64>().unwrap_or(0),
                                    Err(_) => 0,
                                };
                                match attr.key.local_name().as_ref() {
                                    b"cx" => parsed.anchor.width_emu = value,
                                    b"cy" => parsed.anchor.height_emu = value,
                                    _ => {}
                                }
                            }
                        }
                    }
                    b"blip" => {
                        if let Some(parsed) = current.as_mut() {
                            for attr in e.attributes().flatten() {
                                if attr.key.local_name().as_ref() == b"embed"
                                    && let Ok(value) = attr.unescape_value()
                                {
                                    parsed.rel_id = Some(value.into_owned());
                                }
                            }
                        }
                    }
                    b"col" => pending_field = Some("col"),
                    b"colOff" => pending_field = Some("colOff"),
                    b"row" => pending_field = Some("row"),
                    b"rowOff" => pending_field = Some("rowOff"),
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let (Some(parsed), Some(field)) = (current.as_mut(), pending_field) {
                    let value = t.unescape().unwrap_or_default().parse::<i64>().unwrap_or(0);
                    apply_marker_field(&mut parsed.anchor, &corner, field, value);
                }
            }
            Event::End(e) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"from" | b"to" => corner = Corner::None,
                    b"col" | b"colOff" | b"row" | b"rowOff" => pending_field = None,
                    b"twoCellAnchor" | b"oneCellAnchor" | b"absoluteAnchor" => {
                        if let Some(mut parsed) = current.take() {
                            finalize_anchor(&mut parsed.anchor);
                            anchors.push(parsed);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(anchors)
}

fn apply_marker_field(anchor: &mut Anchor, corner: &Corner, field: &str, value: i64) {
    match corner {
        Corner::From => match field {
            // markers are 0-based in the XML, spreadsheet rows are 1-based
            "row" => anchor.row_start = value as u32 + 1,
            "col" => anchor.col_start = value as u32 + 1,
            "rowOff" => anchor.row_offs_top = value,
            "colOff" => anchor.col_offs_left = value,
            _ => {}
        },
        Corner::To => match field {
            "row" => anchor.row_end = value as u32 + 1,
            "col" => anchor.col_end = value as u32 + 1,
            "rowOff" => anchor.row_offs_bottom = value,
            "colOff" => anchor.col_offs_right = value,
            _ => {}
        },
        Corner::None => {}
    }
}

fn finalize_anchor(anchor: &mut Anchor) {
    match anchor.anchor_type {
        AnchorType::TwoCell => {
            anchor.height_emu = (anchor.row_end as i64 - anchor.row_start as i64) * EMU_PER_INCH
                + anchor.row_offs_bottom
                - anchor.row_offs_top;
            anchor.width_emu = (anchor.col_end as i64 - anchor.col_start as i64) * EMU_PER_INCH
                + anchor.col_offs_right
                - anchor.col_offs_left;
        }
        AnchorType::OneCell | AnchorType::Unknown => {
            if anchor.height_emu > 0 {
                let height_inches = anchor.height_emu as f64 / EMU_PER_INCH as f64;
                let approx_rows = (height_inches * APPROX_ROWS_PER_INCH).round().max(1.0) as u32;
                anchor.row_end = anchor.row_start + approx_rows;
            } else {
                anchor.row_end = anchor.row_start;
            }
            // pictures in these sheets do not span columns
            anchor.col_end = anchor.col_start;
        }
    }
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut rels = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e)
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes().flatten() {
                    match attr.key.local_name().as_ref() {
                        b"Id" => id = attr.unescape_value().ok().map(|v| v.into_owned()),
                        b"Target" => target = attr.unescape_value().ok().map(|v| v.into_owned()),
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    rels.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rels)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CELL_XML: &str = r#"<?xml version="1.0"?>
<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <xdr:twoCellAnchor>
    <xdr:from><xdr:col>1</xdr:col><xdr:colOff>120000</xdr:colOff><xdr:row>41</xdr:row><xdr:rowOff>50000</xdr:rowOff></xdr:from>
    <xdr:to><xdr:col>5</xdr:col><xdr:colOff>30000</xdr:colOff><xdr:row>57</xdr:row><xdr:rowOff>10000</xdr:rowOff></xdr:to>
    <xdr:pic><xdr:blipFill><a:blip r:embed="rId1"/></xdr:blipFill></xdr:pic>
  </xdr:twoCellAnchor>
  <xdr:oneCellAnchor>
    <xdr:from><xdr:col>2</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>10</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>
    <xdr:ext cx="914400" cy="1828800"/>
    <xdr:pic><xdr:blipFill><a:blip r:embed="rId2"/></xdr:blipFill></xdr:pic>
  </xdr:oneCellAnchor>
</xdr:wsDr>"#;

    #[test]
    fn two_cell_anchor_geometry() {
        let anchors = parse_anchors(TWO_CELL_XML).unwrap();
        assert_eq!(anchors.len(), 2);

        let two = &anchors[0];
        assert_eq!(two.anchor.anchor_type, AnchorType::TwoCell);
        assert_eq!(two.anchor.row_start, 42);
        assert_eq!(two.anchor.row_end, 58);
        assert_eq!(two.anchor.col_start, 2);
        assert_eq!(two.anchor.col_end, 6);
        assert_eq!(two.anchor.row_offs_top, 50_000);
        assert_eq!(two.anchor.row_offs_bottom, 10_000);
        assert_eq!(
            two.anchor.height_emu,
            16 * EMU_PER_INCH + 10_000 - 50_000
        );
        assert_eq!(two.rel_id.as_deref(), Some("rId1"));
    }

    #[test]
    fn one_cell_anchor_approximates_row_span_from_extent() {
        let anchors = parse_anchors(TWO_CELL_XML).unwrap();
        let one = &anchors[1];
        assert_eq!(one.anchor.anchor_type, AnchorType::OneCell);
        assert_eq!(one.anchor.row_start, 11);
        // 1828800 EMU = 2 inches -> 30 rows at 15 rows/inch
        assert_eq!(one.anchor.row_end, 11 + 30);
        assert_eq!(one.anchor.col_end, one.anchor.col_start);
        assert_eq!(one.rel_id.as_deref(), Some("rId2"));
    }

    #[test]
    fn relationships_parse_id_to_target() {
        let xml = r#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://example/image" Target="../media/image2.png"/>
</Relationships>"#;
        let rels = parse_relationships(xml).unwrap();
        assert_eq!(rels.get("rId1").map(String::as_str), Some("../media/image2.png"));
        assert_eq!(resolve_media_target("../media/image2.png"), "xl/media/image2.png");
    }
}
