//! Motor and app configuration objects
//!
//! A [`ConfigParams`] holds named, typed parameters in display order plus the
//! order in which the firmware serializes them. The serialized form starts
//! with a 32-bit signature computed from the serialize order, so a host and a
//! firmware that disagree on the layout are detected instead of misread.
//!
//! # XML backups
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <MCConfiguration>
//!   <l_current_max>60</l_current_max>
//!   <motor_type>2</motor_type>
//! </MCConfiguration>
//! ```
//!
//! Loading ignores parameters this object does not know and fails if the
//! root element is missing.

use crate::error::{LinkError, Result};
use crate::protocol::{Checksum, PayloadReader, PayloadWriter};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root element of motor configuration backups
pub const MCCONF_XML_ROOT: &str = "MCConfiguration";
/// Root element of app configuration backups
pub const APPCONF_XML_ROOT: &str = "APPConfiguration";

/// Relative tolerance when comparing double parameters
const DOUBLE_EPS: f64 = 0.0001;

/// Wire encoding of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    Undefined = 0,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    Double16,
    Double32,
    Double32Auto,
}

/// Current value of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Double(f64),
    Int(i32),
    String(String),
    Enum(i32),
    Bool(bool),
}

impl ParamValue {
    /// Type number used in the signature
    fn type_id(&self) -> u8 {
        match self {
            ParamValue::Double(_) => 1,
            ParamValue::Int(_) => 2,
            ParamValue::String(_) => 3,
            ParamValue::Enum(_) => 4,
            ParamValue::Bool(_) => 5,
        }
    }

    fn as_xml_text(&self) -> String {
        match self {
            ParamValue::Double(v) => v.to_string(),
            ParamValue::Int(v) | ParamValue::Enum(v) => v.to_string(),
            ParamValue::Bool(v) => (*v as i32).to_string(),
            ParamValue::String(s) => s.clone(),
        }
    }

    /// Parse `text` as a value of the same type
    fn parse_like(&self, text: &str) -> Option<ParamValue> {
        let text = text.trim();
        Some(match self {
            ParamValue::Double(_) => ParamValue::Double(text.parse().ok()?),
            ParamValue::Int(_) => ParamValue::Int(text.parse().ok()?),
            ParamValue::Enum(_) => ParamValue::Enum(text.parse().ok()?),
            ParamValue::Bool(_) => ParamValue::Bool(text.parse::<i32>().ok()? != 0),
            ParamValue::String(_) => ParamValue::String(text.to_string()),
        })
    }

    fn same_as(&self, other: &ParamValue) -> Option<bool> {
        match (self, other) {
            (ParamValue::Double(a), ParamValue::Double(b)) => Some(almost_equal(*a, *b, DOUBLE_EPS)),
            (ParamValue::Int(a), ParamValue::Int(b)) | (ParamValue::Enum(a), ParamValue::Enum(b)) => {
                Some(a == b)
            }
            (ParamValue::Bool(a), ParamValue::Bool(b)) => Some(a == b),
            (ParamValue::String(a), ParamValue::String(b)) => Some(a == b),
            _ => None,
        }
    }
}

fn xml_write_err(e: impl std::fmt::Display) -> LinkError {
    LinkError::Serialization(format!("XML: {}", e))
}

fn xml_read_err(e: impl std::fmt::Display) -> LinkError {
    LinkError::Decode(format!("XML: {}", e))
}

fn almost_equal(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps * 1f64.max(a.abs().max(b.abs()))
}

/// One configuration parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParam {
    pub long_name: String,
    pub value: ParamValue,
    pub tx: TxType,
    /// Scale for `Double16` and `Double32`
    pub tx_scale: f64,
    pub enum_names: Vec<String>,
}

impl ConfigParam {
    pub fn double(long_name: &str, value: f64, tx: TxType, tx_scale: f64) -> Self {
        Self {
            long_name: long_name.to_string(),
            value: ParamValue::Double(value),
            tx,
            tx_scale,
            enum_names: Vec::new(),
        }
    }

    pub fn int(long_name: &str, value: i32, tx: TxType) -> Self {
        Self {
            long_name: long_name.to_string(),
            value: ParamValue::Int(value),
            tx,
            tx_scale: 1.0,
            enum_names: Vec::new(),
        }
    }

    pub fn enumeration(long_name: &str, value: i32, names: &[&str]) -> Self {
        Self {
            long_name: long_name.to_string(),
            value: ParamValue::Enum(value),
            tx: TxType::Undefined,
            tx_scale: 1.0,
            enum_names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn boolean(long_name: &str, value: bool) -> Self {
        Self {
            long_name: long_name.to_string(),
            value: ParamValue::Bool(value),
            tx: TxType::Undefined,
            tx_scale: 1.0,
            enum_names: Vec::new(),
        }
    }

    /// Strings are kept in backups but never transmitted
    pub fn string(long_name: &str, value: &str) -> Self {
        Self {
            long_name: long_name.to_string(),
            value: ParamValue::String(value.to_string()),
            tx: TxType::Undefined,
            tx_scale: 1.0,
            enum_names: Vec::new(),
        }
    }

    fn write(&self, name: &str, w: &mut PayloadWriter) {
        match (&self.value, self.tx) {
            (ParamValue::Double(v), TxType::Double16) => {
                w.put_double16(*v, self.tx_scale);
            }
            (ParamValue::Double(v), TxType::Double32) => {
                w.put_double32(*v, self.tx_scale);
            }
            (ParamValue::Double(v), TxType::Double32Auto) => {
                w.put_double32_auto(*v);
            }
            (ParamValue::Int(v), TxType::U8) => {
                w.put_u8(*v as u8);
            }
            (ParamValue::Int(v), TxType::I8) => {
                w.put_i8(*v as i8);
            }
            (ParamValue::Int(v), TxType::U16) => {
                w.put_u16(*v as u16);
            }
            (ParamValue::Int(v), TxType::I16) => {
                w.put_i16(*v as i16);
            }
            (ParamValue::Int(v), TxType::U32) => {
                w.put_u32(*v as u32);
            }
            (ParamValue::Int(v), TxType::I32) => {
                w.put_i32(*v);
            }
            (ParamValue::Enum(v), _) => {
                w.put_i8(*v as i8);
            }
            (ParamValue::Bool(v), _) => {
                w.put_i8(*v as i8);
            }
            (ParamValue::String(_), _) => {
                tracing::warn!("{}: string parameters are not serialized", name);
            }
            _ => tracing::warn!("{}: wrong tx type {:?}", name, self.tx),
        }
    }

    fn read(&self, name: &str, r: &mut PayloadReader<'_>) -> Result<Option<ParamValue>> {
        let value = match (&self.value, self.tx) {
            (ParamValue::Double(_), TxType::Double16) => ParamValue::Double(r.get_double16(self.tx_scale)?),
            (ParamValue::Double(_), TxType::Double32) => ParamValue::Double(r.get_double32(self.tx_scale)?),
            (ParamValue::Double(_), TxType::Double32Auto) => ParamValue::Double(r.get_double32_auto()?),
            (ParamValue::Int(_), TxType::U8) => ParamValue::Int(r.get_u8()? as i32),
            (ParamValue::Int(_), TxType::I8) => ParamValue::Int(r.get_i8()? as i32),
            (ParamValue::Int(_), TxType::U16) => ParamValue::Int(r.get_u16()? as i32),
            (ParamValue::Int(_), TxType::I16) => ParamValue::Int(r.get_i16()? as i32),
            (ParamValue::Int(_), TxType::U32) => ParamValue::Int(r.get_u32()? as i32),
            (ParamValue::Int(_), TxType::I32) => ParamValue::Int(r.get_i32()?),
            (ParamValue::Enum(_), _) => ParamValue::Enum(r.get_i8()? as i32),
            (ParamValue::Bool(_), _) => ParamValue::Bool(r.get_i8()? != 0),
            (ParamValue::String(_), _) => return Ok(None),
            _ => {
                tracing::warn!("{}: wrong tx type {:?}", name, self.tx);
                return Ok(None);
            }
        };
        Ok(Some(value))
    }
}

/// Ordered set of configuration parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigParams {
    params: HashMap<String, ConfigParam>,
    order: Vec<String>,
    serialize_order: Vec<String>,
}

impl ConfigParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter, appending new names to the display order
    pub fn add_param(&mut self, name: &str, param: ConfigParam) {
        if self.params.insert(name.to_string(), param).is_none() {
            self.order.push(name.to_string());
        }
    }

    pub fn remove_param(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.serialize_order.retain(|n| n != name);
        self.params.remove(name).is_some()
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn param(&self, name: &str) -> Option<&ConfigParam> {
        self.params.get(name)
    }

    /// Parameter names in display order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name).map(|p| &p.value)
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.value(name)? {
            ParamValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.value(name)? {
            ParamValue::Int(v) | ParamValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.value(name)? {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Name of the selected enum entry
    pub fn get_enum_name(&self, name: &str) -> Option<&str> {
        let param = self.params.get(name)?;
        match param.value {
            ParamValue::Enum(v) => param
                .enum_names
                .get(usize::try_from(v).ok()?)
                .map(String::as_str),
            _ => None,
        }
    }

    /// Update a value of the same type; returns whether it changed
    pub fn set_value(&mut self, name: &str, value: ParamValue) -> Result<bool> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| LinkError::Config(format!("Unknown parameter {}", name)))?;
        if std::mem::discriminant(&param.value) != std::mem::discriminant(&value) {
            return Err(LinkError::Config(format!(
                "Parameter {} is {:?}, not {:?}",
                name, param.value, value
            )));
        }
        let changed = param.value != value;
        param.value = value;
        Ok(changed)
    }

    pub fn serialize_order(&self) -> &[String] {
        &self.serialize_order
    }

    pub fn set_serialize_order(&mut self, order: Vec<String>) {
        self.serialize_order = order;
    }

    /// Layout signature: CRC-32C over names, type ids, tx types and enum names
    pub fn signature(&self) -> u32 {
        let mut sig = String::new();
        for name in &self.serialize_order {
            sig.push_str(name);
            if let Some(p) = self.params.get(name) {
                sig.push_str(&p.value.type_id().to_string());
                sig.push_str(&(p.tx as u8).to_string());
                for n in &p.enum_names {
                    sig.push_str(n);
                }
            }
        }
        Checksum::Crc32c.compute(sig.as_bytes())
    }

    /// Encode signature and values in serialize order
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_u32(self.signature());
        for name in &self.serialize_order {
            match self.params.get(name) {
                Some(p) => p.write(name, &mut w),
                None => tracing::warn!("{} not found", name),
            }
        }
        w.into_vec()
    }

    /// Apply a serialized configuration, returning the names that changed
    ///
    /// Nothing is applied if the signature does not match or the data is
    /// short.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<Vec<String>> {
        let mut r = PayloadReader::new(data);
        let signature = r.get_u32()?;
        let expected = self.signature();
        if signature != expected {
            return Err(LinkError::Decode(format!(
                "Configuration signature {:#010x} does not match {:#010x}",
                signature, expected
            )));
        }

        let mut updates = Vec::new();
        for name in &self.serialize_order {
            let Some(p) = self.params.get(name) else {
                tracing::warn!("{} not found", name);
                continue;
            };
            if let Some(value) = p.read(name, &mut r)? {
                updates.push((name.clone(), value));
            }
        }

        let mut changed = Vec::new();
        for (name, value) in updates {
            if let Some(p) = self.params.get_mut(&name) {
                if p.value != value {
                    p.value = value;
                    changed.push(name);
                }
            }
        }
        Ok(changed)
    }

    /// Names of parameters whose values differ from `other`
    pub fn check_difference(&self, other: &ConfigParams) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                match (self.params.get(*name), other.params.get(*name)) {
                    (Some(a), Some(b)) => a.value.same_as(&b.value) == Some(false),
                    _ => false,
                }
            })
            .cloned()
            .collect()
    }

    // ==================== XML ====================

    /// Render as an XML document rooted at `config_name`
    pub fn to_xml(&self, config_name: &str) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_write_err)?;
        writer
            .write_event(Event::Start(BytesStart::new(config_name)))
            .map_err(xml_write_err)?;
        for name in &self.order {
            let Some(p) = self.params.get(name) else {
                continue;
            };
            let text = p.value.as_xml_text();
            writer
                .write_event(Event::Start(BytesStart::new(name.as_str())))
                .map_err(xml_write_err)?;
            writer
                .write_event(Event::Text(BytesText::new(&text)))
                .map_err(xml_write_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(name.as_str())))
                .map_err(xml_write_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(config_name)))
            .map_err(xml_write_err)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| LinkError::Serialization(format!("XML: {}", e)))
    }

    /// Apply values from an XML document, returning the names that changed
    pub fn apply_xml(&mut self, xml: &str, config_name: &str) -> Result<Vec<String>> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut in_root = false;
        let mut current: Option<String> = None;
        let mut text = String::new();
        let mut changed = Vec::new();

        loop {
            match reader.read_event().map_err(xml_read_err)? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if !in_root {
                        in_root = name == config_name;
                    } else if current.is_none() {
                        current = Some(name);
                        text.clear();
                    }
                }
                Event::Empty(e) if in_root && current.is_none() => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.apply_text(&name, "", &mut changed);
                }
                Event::Text(e) if current.is_some() => {
                    text.push_str(&e.unescape().map_err(xml_read_err)?);
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if current.as_deref() == Some(name.as_str()) {
                        current = None;
                        self.apply_text(&name, &text, &mut changed);
                    } else if in_root && name == config_name {
                        break;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !in_root {
            return Err(LinkError::Config(format!("tag {} not found", config_name)));
        }
        Ok(changed)
    }

    fn apply_text(&mut self, name: &str, text: &str, changed: &mut Vec<String>) {
        let Some(p) = self.params.get_mut(name) else {
            tracing::warn!("Parameter not found: {}", name);
            return;
        };
        match p.value.parse_like(text) {
            Some(value) if value != p.value => {
                p.value = value;
                changed.push(name.to_string());
            }
            Some(_) => {}
            None => tracing::warn!("{}: could not parse {:?}", name, text),
        }
    }

    /// Write an XML backup file
    pub fn save_xml(&self, path: impl AsRef<Path>, config_name: &str) -> Result<()> {
        let path = path.as_ref();
        let xml = self.to_xml(config_name)?;
        std::fs::write(path, xml).map_err(|e| {
            LinkError::Config(format!("Could not open {} for writing: {}", path.display(), e))
        })
    }

    /// Load an XML backup file
    pub fn load_xml(&mut self, path: impl AsRef<Path>, config_name: &str) -> Result<Vec<String>> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("Could not open {} for reading: {}", path.display(), e))
        })?;
        self.apply_xml(&xml, config_name)
    }
}
