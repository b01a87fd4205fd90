//! Tensor metadata carried by streams between elements.
//!
//! A stream either carries tensors (`other/tensor` / `other/tensors` caps)
//! or raw media. Tensor streams are described by [`TensorsInfo`]; the data
//! of one buffer is a [`TensorsData`] holding one byte chunk per tensor.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Maximum rank of a single tensor.
pub const TENSOR_RANK_LIMIT: usize = 16;

/// Maximum number of tensors in one buffer.
pub const TENSOR_SIZE_LIMIT: usize = 16;

/// Errors produced while parsing or validating tensor metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapsError {
    #[error("Empty caps description")]
    Empty,

    #[error("Unknown tensor type: {0}")]
    UnknownType(String),

    #[error("Invalid tensor dimension: {0}")]
    InvalidDimension(String),

    #[error("Unknown tensor format: {0}")]
    UnknownFormat(String),

    #[error("Malformed caps field: {0}")]
    MalformedField(String),

    #[error("Tensor count mismatch: declared {declared}, described {found}")]
    CountMismatch { declared: usize, found: usize },

    #[error("Too many tensors: {0} (limit {TENSOR_SIZE_LIMIT})")]
    TooManyTensors(usize),

    #[error("Tensor byte size overflows: {0}")]
    SizeOverflow(String),
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorType {
    Int32,
    Uint32,
    Int16,
    Uint16,
    Int8,
    Uint8,
    Float64,
    Float32,
    Int64,
    Uint64,
    Float16,
}

impl TensorType {
    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 | Self::Float16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    /// Name used in caps strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Float64 => "float64",
            Self::Float32 => "float32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float16 => "float16",
        }
    }
}

impl FromStr for TensorType {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "int32" => Self::Int32,
            "uint32" => Self::Uint32,
            "int16" => Self::Int16,
            "uint16" => Self::Uint16,
            "int8" => Self::Int8,
            "uint8" => Self::Uint8,
            "float64" => Self::Float64,
            "float32" => Self::Float32,
            "int64" => Self::Int64,
            "uint64" => Self::Uint64,
            "float16" => Self::Float16,
            other => return Err(CapsError::UnknownType(other.to_string())),
        })
    }
}

impl std::fmt::Display for TensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape and type of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Optional tensor name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Element type
    pub tensor_type: TensorType,
    /// Dimensions, innermost first (`4:1:1:1` is four elements)
    pub dimension: Vec<u32>,
}

impl TensorInfo {
    pub fn new(tensor_type: TensorType, dimension: impl Into<Vec<u32>>) -> Self {
        Self {
            name: None,
            tensor_type,
            dimension: dimension.into(),
        }
    }

    /// Number of elements in the tensor, `None` if it does not fit a `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.dimension
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d as usize))
    }

    /// Size in bytes of the tensor, `None` on overflow.
    pub fn size(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.tensor_type.element_size())
    }

    pub fn is_valid(&self) -> bool {
        !self.dimension.is_empty()
            && self.dimension.len() <= TENSOR_RANK_LIMIT
            && self.dimension.iter().all(|d| *d > 0)
            && self.size().is_some()
    }

    /// Dimension in caps notation (`4:1:1:1`).
    pub fn dimension_string(&self) -> String {
        self.dimension
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parse a dimension in caps notation.
    pub fn parse_dimension(text: &str) -> Result<Vec<u32>, CapsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CapsError::InvalidDimension(text.to_string()));
        }
        let dims = text
            .split(':')
            .map(|part| match part.trim().parse::<u32>() {
                Ok(d) if d > 0 => Ok(d),
                _ => Err(CapsError::InvalidDimension(text.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if dims.len() > TENSOR_RANK_LIMIT {
            return Err(CapsError::InvalidDimension(text.to_string()));
        }
        Ok(dims)
    }

    /// Same type and shape, ignoring trailing dimensions of 1.
    pub fn same_shape(&self, other: &TensorInfo) -> bool {
        fn trimmed(dims: &[u32]) -> &[u32] {
            let len = dims.iter().rposition(|d| *d != 1).map_or(0, |i| i + 1);
            &dims[..len]
        }
        self.tensor_type == other.tensor_type
            && trimmed(&self.dimension) == trimmed(&other.dimension)
    }
}

/// How tensor shapes are fixed on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorFormat {
    /// Shapes are fixed by the caps
    #[default]
    Static,
    /// Every buffer carries its own shape
    Flexible,
    /// Sparse tensors, shape carried per buffer
    Sparse,
}

impl TensorFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Flexible => "flexible",
            Self::Sparse => "sparse",
        }
    }
}

impl FromStr for TensorFormat {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "static" => Ok(Self::Static),
            "flexible" => Ok(Self::Flexible),
            "sparse" => Ok(Self::Sparse),
            other => Err(CapsError::UnknownFormat(other.to_string())),
        }
    }
}

/// Metadata for all tensors of one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TensorsInfo {
    #[serde(default)]
    pub format: TensorFormat,
    pub tensors: Vec<TensorInfo>,
}

impl TensorsInfo {
    /// Static metadata for the given tensors.
    pub fn new(tensors: Vec<TensorInfo>) -> Self {
        Self {
            format: TensorFormat::Static,
            tensors,
        }
    }

    /// Static metadata for a single tensor.
    pub fn single(info: TensorInfo) -> Self {
        Self::new(vec![info])
    }

    /// Flexible metadata with the given per-buffer shapes.
    pub fn flexible(tensors: Vec<TensorInfo>) -> Self {
        Self {
            format: TensorFormat::Flexible,
            tensors,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn is_flexible(&self) -> bool {
        self.format != TensorFormat::Static
    }

    /// Static metadata needs 1..=16 valid tensors whose sizes add up
    /// without overflow; flexible metadata only bounds the count.
    pub fn is_valid(&self) -> bool {
        if self.tensors.len() > TENSOR_SIZE_LIMIT || self.total_size().is_none() {
            return false;
        }
        match self.format {
            TensorFormat::Static => {
                !self.tensors.is_empty() && self.tensors.iter().all(TensorInfo::is_valid)
            }
            TensorFormat::Flexible | TensorFormat::Sparse => {
                self.tensors.iter().all(TensorInfo::is_valid)
            }
        }
    }

    /// Size in bytes of one buffer, `None` on overflow.
    pub fn total_size(&self) -> Option<usize> {
        self.tensors
            .iter()
            .try_fold(0usize, |acc, t| acc.checked_add(t.size()?))
    }

    /// Size in bytes of the tensor at `index`.
    pub fn tensor_size(&self, index: usize) -> Option<usize> {
        self.tensors.get(index).and_then(TensorInfo::size)
    }

    /// Whether data described by `other` can flow where `self` is expected.
    pub fn is_compatible(&self, other: &TensorsInfo) -> bool {
        if self.format != other.format {
            return false;
        }
        if self.is_flexible() {
            return true;
        }
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(&other.tensors)
                .all(|(a, b)| a.same_shape(b))
    }

    /// Caps string describing these tensors.
    pub fn to_caps_string(&self) -> String {
        match (self.format, self.tensors.as_slice()) {
            (TensorFormat::Static, [single]) => format!(
                "other/tensor,dimension={},type={}",
                single.dimension_string(),
                single.tensor_type
            ),
            (TensorFormat::Static, tensors) => format!(
                "other/tensors,format=static,num_tensors={},dimensions={},types={}",
                tensors.len(),
                tensors
                    .iter()
                    .map(TensorInfo::dimension_string)
                    .collect::<Vec<_>>()
                    .join("."),
                tensors
                    .iter()
                    .map(|t| t.tensor_type.as_str())
                    .collect::<Vec<_>>()
                    .join(".")
            ),
            (format, _) => format!("other/tensors,format={}", format.as_str()),
        }
    }
}

/// The bytes of one buffer, one chunk per tensor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorsData {
    pub tensors: Vec<Vec<u8>>,
    /// Per-buffer metadata, required on flexible streams
    pub info: Option<TensorsInfo>,
}

impl TensorsData {
    pub fn new(tensors: Vec<Vec<u8>>) -> Self {
        Self {
            tensors,
            info: None,
        }
    }

    /// Data carrying its own metadata.
    pub fn with_info(tensors: Vec<Vec<u8>>, info: TensorsInfo) -> Self {
        Self {
            tensors,
            info: Some(info),
        }
    }

    /// Data made of a single tensor.
    pub fn single(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(vec![bytes.into()])
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.tensors.iter().map(Vec::len).sum()
    }
}

/// Negotiated format of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCaps {
    /// Tensor stream
    Tensors(TensorsInfo),
    /// Raw media (audio, video, text, ...) identified by its media type
    Media { mime: String },
}

impl StreamCaps {
    /// Parse a caps string such as
    /// `other/tensors,num_tensors=2,dimensions=4:1.2:2,types=uint8.float32`.
    ///
    /// GStreamer's serialized form (`dimension=(string)4:1:1:1`, quoted
    /// lists with escaped commas) is accepted as well.
    pub fn parse(text: &str) -> Result<Self, CapsError> {
        let fields = split_fields(text);
        let Some((mime, rest)) = fields.split_first() else {
            return Err(CapsError::Empty);
        };
        let mime = mime.trim();
        if mime.is_empty() {
            return Err(CapsError::Empty);
        }

        let mut values = Vec::with_capacity(rest.len());
        for field in rest {
            let Some((key, value)) = field.split_once('=') else {
                return Err(CapsError::MalformedField(field.clone()));
            };
            values.push((key.trim().to_string(), clean_value(value)));
        }
        let lookup = |key: &str| {
            values
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        match mime {
            "other/tensor" => {
                let dimension = lookup("dimension")
                    .ok_or_else(|| CapsError::MalformedField("dimension".to_string()))?;
                let tensor_type = lookup("type")
                    .ok_or_else(|| CapsError::MalformedField("type".to_string()))?;
                let info = TensorInfo::new(
                    tensor_type.parse()?,
                    TensorInfo::parse_dimension(dimension)?,
                );
                checked(TensorsInfo::single(info))
            }
            "other/tensors" => {
                let format = match lookup("format") {
                    Some(f) => f.parse()?,
                    None => TensorFormat::Static,
                };
                let dimensions = lookup("dimensions").map(split_list).unwrap_or_default();
                let types = lookup("types").map(split_list).unwrap_or_default();

                if format == TensorFormat::Static && (dimensions.is_empty() || types.is_empty()) {
                    return Err(CapsError::MalformedField(
                        "static tensors need dimensions and types".to_string(),
                    ));
                }
                if dimensions.len() != types.len() {
                    return Err(CapsError::CountMismatch {
                        declared: dimensions.len(),
                        found: types.len(),
                    });
                }
                if let Some(num) = lookup("num_tensors") {
                    let declared = num
                        .parse::<usize>()
                        .map_err(|_| CapsError::MalformedField(format!("num_tensors={}", num)))?;
                    if format == TensorFormat::Static && declared != dimensions.len() {
                        return Err(CapsError::CountMismatch {
                            declared,
                            found: dimensions.len(),
                        });
                    }
                }
                if dimensions.len() > TENSOR_SIZE_LIMIT {
                    return Err(CapsError::TooManyTensors(dimensions.len()));
                }

                let tensors = dimensions
                    .iter()
                    .zip(&types)
                    .map(|(dim, ty)| -> Result<TensorInfo, CapsError> {
                        Ok(TensorInfo::new(
                            ty.parse()?,
                            TensorInfo::parse_dimension(dim)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                checked(TensorsInfo { format, tensors })
            }
            other => Ok(StreamCaps::Media {
                mime: other.to_string(),
            }),
        }
    }

    pub fn tensors_info(&self) -> Option<&TensorsInfo> {
        match self {
            StreamCaps::Tensors(info) => Some(info),
            StreamCaps::Media { .. } => None,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, StreamCaps::Media { .. })
    }
}

impl std::fmt::Display for StreamCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamCaps::Tensors(info) => f.write_str(&info.to_caps_string()),
            StreamCaps::Media { mime } => f.write_str(mime),
        }
    }
}

/// Reject metadata whose byte size does not fit a `usize`.
fn checked(info: TensorsInfo) -> Result<StreamCaps, CapsError> {
    if info.total_size().is_none() {
        return Err(CapsError::SizeOverflow(info.to_caps_string()));
    }
    Ok(StreamCaps::Tensors(info))
}

/// Split a caps string on top-level commas, honouring quotes and escapes.
fn split_fields(text: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        fields.push(current);
    }
    fields
}

/// Strip a `(type)` annotation and surrounding quotes from a field value.
fn clean_value(value: &str) -> String {
    let mut value = value.trim();
    if value.starts_with('(') {
        if let Some(end) = value.find(')') {
            value = value[end + 1..].trim();
        }
    }
    value.trim_matches('"').trim().to_string()
}

/// Split a `dimensions`/`types` list; `.` and `,` are both separators.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(['.', ','])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
