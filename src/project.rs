//! Reading and rewriting of QGIS project documents.
//!
//! A project is either a plain `.qgs` XML file or a `.qgz` zip holding the
//! `.qgs` entry plus sidecar files. Layers appear twice in the XML: as
//! `<maplayer>` blocks under `<projectlayers>` and as `<layer-tree-layer>`
//! nodes carrying duplicated `source`/`providerKey` attributes. Rewrites
//! have to touch both or the file opens inconsistently.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::datasource::{Datasource, FieldOverrides};
use crate::error::{Error, Result};

/// One layer as stored in the document.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub datasource: String,
}

impl LayerEntry {
    /// Layers served by the relational backend; everything else is
    /// file-backed or synthetic and passes through export untouched.
    pub fn is_database_backed(&self) -> bool {
        self.provider == "postgres"
    }
}

/// Replacement values for one layer, applied to the maplayer block and
/// the matching layer-tree node.
#[derive(Debug, Clone, Default)]
pub struct LayerEdit {
    pub datasource: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug)]
enum Container {
    Plain,
    Zipped {
        entry_name: String,
        /// Sidecar entries copied through unchanged, e.g. the `.qgd`
        /// auxiliary storage.
        other_entries: Vec<(String, Vec<u8>)>,
    },
}

#[derive(Debug)]
pub struct ProjectDocument {
    path: PathBuf,
    xml: String,
    container: Container,
    layers: Vec<LayerEntry>,
}

impl ProjectDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let is_zipped = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("qgz"))
            .unwrap_or(false);

        let (xml, container) = if is_zipped {
            let (xml, entry_name, other_entries) = read_zipped(path)?;
            (
                xml,
                Container::Zipped {
                    entry_name,
                    other_entries,
                },
            )
        } else {
            (std::fs::read_to_string(path)?, Container::Plain)
        };

        let layers = collect_layers(&xml)?;
        debug!(
            "read project '{}' with {} layers",
            path.display(),
            layers.len()
        );
        Ok(ProjectDocument {
            path: path.to_path_buf(),
            xml,
            container,
            layers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn layers(&self) -> &[LayerEntry] {
        &self.layers
    }

    /// File name of a sibling variant, e.g. `survey.qgs` with suffix
    /// `portable` becomes `survey_portable.qgs`.
    pub fn variant_file_name(&self, suffix: &str) -> String {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("project");
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("qgs");
        format!("{}_{}.{}", stem, suffix, ext)
    }

    pub fn variant_path(&self, suffix: &str) -> PathBuf {
        self.path.with_file_name(self.variant_file_name(suffix))
    }

    /// Produces a rewritten copy of the document XML. Layers without an
    /// edit reserialize as they were; everything outside the edited
    /// elements streams through untouched.
    pub fn apply(&self, edits: &HashMap<String, LayerEdit>) -> Result<String> {
        let mut reader = XmlReader::from_str(&self.xml);
        let mut writer = XmlWriter::new(Cursor::new(Vec::new()));
        let mut buf = Vec::new();

        let mut maplayer_index = 0usize;
        let mut active_edit: Option<&LayerEdit> = None;
        let mut skip_until: Option<Vec<u8>> = None;

        loop {
            let event = reader.read_event_into(&mut buf).map_err(xml_err)?;

            // While replacing an element's text, drop the original
            // content until its closing tag.
            if skip_until.is_some() {
                let end = match &event {
                    Event::End(e) => Some(e.name().as_ref().to_vec()),
                    Event::Eof => {
                        return Err(Error::Project(
                            "unterminated element in project XML".to_string(),
                        ))
                    }
                    _ => None,
                };
                if end.as_deref() == skip_until.as_deref() {
                    writer.write_event(event).map_err(xml_err)?;
                    skip_until = None;
                }
                buf.clear();
                continue;
            }

            match event {
                Event::Eof => break,
                Event::Start(e) => match e.name().as_ref() {
                    b"maplayer" => {
                        active_edit = self
                            .layers
                            .get(maplayer_index)
                            .and_then(|layer| edits.get(layer.id.as_str()));
                        maplayer_index += 1;
                        writer.write_event(Event::Start(e)).map_err(xml_err)?;
                    }
                    b"datasource" => {
                        writer.write_event(Event::Start(e)).map_err(xml_err)?;
                        if let Some(text) = active_edit.and_then(|ed| ed.datasource.as_deref()) {
                            writer.write_event(text_event(text)).map_err(xml_err)?;
                            skip_until = Some(b"datasource".to_vec());
                        }
                    }
                    b"provider" => {
                        writer.write_event(Event::Start(e)).map_err(xml_err)?;
                        if let Some(text) = active_edit.and_then(|ed| ed.provider.as_deref()) {
                            writer.write_event(text_event(text)).map_err(xml_err)?;
                            skip_until = Some(b"provider".to_vec());
                        }
                    }
                    b"layer-tree-layer" => {
                        match tree_layer_edit(&e, edits)? {
                            Some(edit) => {
                                let elem = rebuild_tree_layer(&e, edit)?;
                                writer.write_event(Event::Start(elem)).map_err(xml_err)?;
                            }
                            None => writer.write_event(Event::Start(e)).map_err(xml_err)?,
                        }
                    }
                    _ => writer.write_event(Event::Start(e)).map_err(xml_err)?,
                },
                Event::Empty(e) => match e.name().as_ref() {
                    b"layer-tree-layer" => {
                        match tree_layer_edit(&e, edits)? {
                            Some(edit) => {
                                let elem = rebuild_tree_layer(&e, edit)?;
                                writer.write_event(Event::Empty(elem)).map_err(xml_err)?;
                            }
                            None => writer.write_event(Event::Empty(e)).map_err(xml_err)?,
                        }
                    }
                    b"datasource" if active_edit.map(|ed| ed.datasource.is_some()) == Some(true) => {
                        // An empty element gains real content.
                        let text = active_edit
                            .and_then(|ed| ed.datasource.as_deref())
                            .unwrap_or_default();
                        let end = Event::End(e.to_end().into_owned());
                        writer.write_event(Event::Start(e)).map_err(xml_err)?;
                        writer.write_event(text_event(text)).map_err(xml_err)?;
                        writer.write_event(end).map_err(xml_err)?;
                    }
                    _ => writer.write_event(Event::Empty(e)).map_err(xml_err)?,
                },
                Event::End(e) => {
                    if e.name().as_ref() == b"maplayer" {
                        active_edit = None;
                    }
                    writer.write_event(Event::End(e)).map_err(xml_err)?;
                }
                other => writer.write_event(other).map_err(xml_err)?,
            }
            buf.clear();
        }

        let bytes = writer.into_inner().into_inner();
        String::from_utf8(bytes)
            .map_err(|e| Error::Project(format!("rewritten document is not UTF-8: {}", e)))
    }

    /// Writes `xml` as a variant document at `dest`, zipped when the
    /// original was zipped, with sidecar entries carried over.
    pub fn write_variant(&self, xml: &str, dest: &Path) -> Result<()> {
        match &self.container {
            Container::Plain => {
                std::fs::write(dest, xml)?;
            }
            Container::Zipped {
                entry_name,
                other_entries,
            } => {
                let file = File::create(dest)?;
                let mut zip = ZipWriter::new(file);
                let options =
                    FileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file(entry_name.as_str(), options)
                    .map_err(|e| zip_err(dest, e))?;
                zip.write_all(xml.as_bytes())?;
                for (name, bytes) in other_entries {
                    zip.start_file(name.as_str(), options)
                        .map_err(|e| zip_err(dest, e))?;
                    zip.write_all(bytes)?;
                }
                zip.finish().map_err(|e| zip_err(dest, e))?;
            }
        }
        debug!("wrote project variant '{}'", dest.display());
        Ok(())
    }
}

/// Outcome of a credential-stripping pass over a whole document.
#[derive(Debug, Default)]
pub struct CleanOutcome {
    pub xml: String,
    pub stripped: usize,
    pub skipped: Vec<String>,
}

/// Strips usernames and passwords from every layer that parses under the
/// connection-string grammar. Database-backed layers that fail to parse
/// are reported as skipped; file-backed sources are not expected to
/// parse and pass through silently.
pub fn clean_document(document: &ProjectDocument) -> Result<CleanOutcome> {
    let mut outcome = CleanOutcome::default();
    let mut edits = HashMap::new();

    for layer in document.layers() {
        match Datasource::parse(&layer.datasource) {
            Ok(ds) if ds.has_credentials() => {
                edits.insert(
                    layer.id.clone(),
                    LayerEdit {
                        datasource: Some(ds.strip_credentials().to_string()),
                        provider: None,
                    },
                );
                outcome.stripped += 1;
            }
            Ok(_) => {}
            Err(e) => {
                if layer.is_database_backed() {
                    warn!("cannot parse datasource of layer '{}': {}", layer.name, e);
                    outcome.skipped.push(layer.name.clone());
                }
            }
        }
    }

    outcome.xml = document.apply(&edits)?;
    Ok(outcome)
}

/// Exact-match source descriptor for the fix-layers pass.
#[derive(Debug, Clone)]
pub struct SourceMatch {
    pub host: String,
    pub port: String,
    pub dbname: String,
}

#[derive(Debug, Default)]
pub struct FixOutcome {
    pub xml: String,
    pub changed: usize,
    pub skipped: Vec<String>,
}

/// Rewrites every database-backed layer whose host, port and database
/// name match `source`, applying the given field overrides. Layers with
/// unparseable connection strings are skipped, not fatal.
pub fn fix_layers(
    document: &ProjectDocument,
    source: &SourceMatch,
    overrides: &FieldOverrides,
) -> Result<FixOutcome> {
    let mut outcome = FixOutcome::default();
    let mut edits = HashMap::new();

    for layer in document.layers() {
        if !layer.is_database_backed() {
            continue;
        }
        let ds = match Datasource::parse(&layer.datasource) {
            Ok(ds) => ds,
            Err(e) => {
                warn!("cannot parse datasource of layer '{}': {}", layer.name, e);
                outcome.skipped.push(layer.name.clone());
                continue;
            }
        };
        if !ds.matches_source(&source.host, &source.port, &source.dbname) {
            continue;
        }
        edits.insert(
            layer.id.clone(),
            LayerEdit {
                datasource: Some(ds.rewrite(overrides).to_string()),
                provider: None,
            },
        );
        outcome.changed += 1;
    }

    outcome.xml = document.apply(&edits)?;
    Ok(outcome)
}

/// Text event with minimal escaping: `&`, `<` and `>` only. Quotes stay
/// literal so rewritten datasources keep the texture QGIS itself writes.
fn text_event(text: &str) -> Event<'_> {
    Event::Text(BytesText::from_escaped(partial_escape(text)))
}

fn collect_layers(xml: &str) -> Result<Vec<LayerEntry>> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    let mut layers = Vec::new();
    let mut in_maplayer = false;
    let mut capture: Option<&'static str> = None;
    let mut id = String::new();
    let mut name = String::new();
    let mut provider = String::new();
    let mut datasource = String::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"maplayer" => {
                    in_maplayer = true;
                    id.clear();
                    name.clear();
                    provider.clear();
                    datasource.clear();
                }
                b"id" if in_maplayer && id.is_empty() => capture = Some("id"),
                b"layername" if in_maplayer && name.is_empty() => capture = Some("name"),
                b"provider" if in_maplayer && provider.is_empty() => capture = Some("provider"),
                b"datasource" if in_maplayer && datasource.is_empty() => {
                    capture = Some("datasource")
                }
                _ => {}
            },
            Event::Text(e) => {
                if let Some(field) = capture {
                    let text = e.unescape().map_err(xml_err)?;
                    match field {
                        "id" => id.push_str(&text),
                        "name" => name.push_str(&text),
                        "provider" => provider.push_str(&text),
                        "datasource" => datasource.push_str(&text),
                        _ => {}
                    }
                }
            }
            Event::CData(e) => {
                if let Some(field) = capture {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    match field {
                        "id" => id.push_str(&text),
                        "name" => name.push_str(&text),
                        "provider" => provider.push_str(&text),
                        "datasource" => datasource.push_str(&text),
                        _ => {}
                    }
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"maplayer" => {
                    in_maplayer = false;
                    layers.push(LayerEntry {
                        id: id.clone(),
                        name: name.clone(),
                        provider: provider.clone(),
                        datasource: datasource.clone(),
                    });
                }
                b"id" | b"layername" | b"provider" | b"datasource" => capture = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(layers)
}

/// Looks up the pending edit for a layer-tree node by its `id` attribute.
fn tree_layer_edit<'e>(
    e: &BytesStart<'_>,
    edits: &'e HashMap<String, LayerEdit>,
) -> Result<Option<&'e LayerEdit>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Project(format!("bad attribute: {}", err)))?;
        if attr.key.as_ref() == b"id" {
            let id = attr.unescape_value().map_err(xml_err)?;
            return Ok(edits.get(id.as_ref()));
        }
    }
    Ok(None)
}

/// Rebuilds a layer-tree node with rewritten `source`/`providerKey`
/// attributes; everything else keeps its original value and order.
fn rebuild_tree_layer<'a>(e: &'a BytesStart<'a>, edit: &'a LayerEdit) -> Result<BytesStart<'a>> {
    let mut elem = BytesStart::new("layer-tree-layer");
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Project(format!("bad attribute: {}", err)))?;
        match attr.key.as_ref() {
            b"source" if edit.datasource.is_some() => {
                if let Some(ds) = &edit.datasource {
                    elem.push_attribute(("source", ds.as_str()));
                }
            }
            b"providerKey" if edit.provider.is_some() => {
                if let Some(p) = &edit.provider {
                    elem.push_attribute(("providerKey", p.as_str()));
                }
            }
            _ => elem.push_attribute(attr),
        }
    }
    Ok(elem)
}

fn read_zipped(path: &Path) -> Result<(String, String, Vec<(String, Vec<u8>)>)> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| zip_err(path, e))?;

    let mut xml = None;
    let mut entry_name = None;
    let mut other_entries = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| zip_err(path, e))?;
        let name = entry.name().to_string();
        if name.ends_with(".qgs") && entry_name.is_none() {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            entry_name = Some(name);
            xml = Some(text);
        } else {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            other_entries.push((name, bytes));
        }
    }

    match (xml, entry_name) {
        (Some(xml), Some(entry_name)) => Ok((xml, entry_name, other_entries)),
        _ => Err(Error::Project(format!(
            "no .qgs entry in '{}'",
            path.display()
        ))),
    }
}

fn xml_err(err: quick_xml::Error) -> Error {
    Error::Project(format!("invalid project XML: {}", err))
}

fn zip_err(path: &Path, err: zip::result::ZipError) -> Error {
    Error::Project(format!("zip error in '{}': {}", path.display(), err))
}
