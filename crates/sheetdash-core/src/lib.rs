//! Core record model and positional TSV column mapping for sheetdash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sheetdash-core";

/// Storage affinity of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
    Integer,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Real => "REAL",
            ColumnKind::Integer => "INTEGER",
        }
    }
}

/// One entry of the output-field to source-column table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub field: &'static str,
    pub source_index: usize,
    pub kind: ColumnKind,
}

const fn text(field: &'static str, source_index: usize) -> ColumnMapping {
    ColumnMapping {
        field,
        source_index,
        kind: ColumnKind::Text,
    }
}

const fn real(field: &'static str, source_index: usize) -> ColumnMapping {
    ColumnMapping {
        field,
        source_index,
        kind: ColumnKind::Real,
    }
}

const fn integer(field: &'static str, source_index: usize) -> ColumnMapping {
    ColumnMapping {
        field,
        source_index,
        kind: ColumnKind::Integer,
    }
}

/// Fixed positional mapping from the published sheet export.
///
/// Mapping is by column position only. Header names are never consulted, so
/// an upstream column insert or reorder silently shifts every field after it.
/// Gaps in the index sequence are columns the dashboard ignores.
pub const COLUMN_MAP: [ColumnMapping; 38] = [
    text("order_number", 0),
    text("order_date", 1),
    text("payment_date", 2),
    text("project_code", 6),
    text("project_name", 8),
    text("unit_no", 9),
    text("house_number", 10),
    text("unit_status", 11),
    text("contact_name", 13),
    text("contact_phone", 14),
    text("product_type", 18),
    text("product_group", 19),
    text("items_group", 22),
    text("product_detail", 23),
    text("color", 24),
    text("brand", 25),
    text("product_size", 26),
    text("room_type", 27),
    text("install_point", 28),
    text("install_size", 29),
    text("supplier_name", 35),
    text("po_number", 36),
    text("po_date", 37),
    text("install_confirm_date", 41),
    text("install_time_slot", 42),
    text("install_date", 43),
    text("delivery_date", 44),
    text("notes", 45),
    text("document_status", 46),
    text("install_status", 47),
    real("cost_total_ex_vat", 48),
    real("cost_total_in_vat", 49),
    real("sale_total_ex_vat", 50),
    real("sale_total_in_vat", 51),
    integer("sales_month", 53),
    integer("sales_year", 54),
    text("building", 55),
    text("floor_level", 56),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowParseError {
    #[error("column {column} value {value:?} does not fit a 64-bit integer")]
    IntegerOutOfRange { column: usize, value: String },
}

/// Borrowed view of one mapped value, yielded in [`COLUMN_MAP`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Real(Option<f64>),
    Integer(Option<i64>),
}

/// One imported spreadsheet line. Dates are kept verbatim as text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DashboardRecord {
    pub order_number: String,
    pub order_date: String,
    pub payment_date: String,
    pub project_code: String,
    pub project_name: String,
    pub unit_no: String,
    pub house_number: String,
    pub unit_status: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub product_type: String,
    pub product_group: String,
    pub items_group: String,
    pub product_detail: String,
    pub color: String,
    pub brand: String,
    pub product_size: String,
    pub room_type: String,
    pub install_point: String,
    pub install_size: String,
    pub supplier_name: String,
    pub po_number: String,
    pub po_date: String,
    pub install_confirm_date: String,
    pub install_time_slot: String,
    pub install_date: String,
    pub delivery_date: String,
    pub notes: String,
    pub document_status: String,
    pub install_status: String,
    pub cost_total_ex_vat: Option<f64>,
    pub cost_total_in_vat: Option<f64>,
    pub sale_total_ex_vat: Option<f64>,
    pub sale_total_in_vat: Option<f64>,
    pub sales_month: Option<i64>,
    pub sales_year: Option<i64>,
    pub building: String,
    pub floor_level: String,
    pub sync_timestamp: String,
}

impl DashboardRecord {
    /// Build a record from already split cells.
    ///
    /// Indices past the end of `cells` read as empty text, so callers that
    /// skip header-width padding still get a fully populated record.
    pub fn from_cells(cells: &[&str], sync_timestamp: &str) -> Result<Self, RowParseError> {
        let cell = |index: usize| cells.get(index).copied().unwrap_or_default();
        let text = |index: usize| cell(index).to_string();
        let real = |index: usize| coerce_float(cell(index));
        let integer = |index: usize| coerce_int(cell(index), index);

        Ok(Self {
            order_number: text(0),
            order_date: text(1),
            payment_date: text(2),
            project_code: text(6),
            project_name: text(8),
            unit_no: text(9),
            house_number: text(10),
            unit_status: text(11),
            contact_name: text(13),
            contact_phone: text(14),
            product_type: text(18),
            product_group: text(19),
            items_group: text(22),
            product_detail: text(23),
            color: text(24),
            brand: text(25),
            product_size: text(26),
            room_type: text(27),
            install_point: text(28),
            install_size: text(29),
            supplier_name: text(35),
            po_number: text(36),
            po_date: text(37),
            install_confirm_date: text(41),
            install_time_slot: text(42),
            install_date: text(43),
            delivery_date: text(44),
            notes: text(45),
            document_status: text(46),
            install_status: text(47),
            cost_total_ex_vat: real(48),
            cost_total_in_vat: real(49),
            sale_total_ex_vat: real(50),
            sale_total_in_vat: real(51),
            sales_month: integer(53)?,
            sales_year: integer(54)?,
            building: text(55),
            floor_level: cell(56).trim_end_matches(['\r', '\n']).to_string(),
            sync_timestamp: sync_timestamp.to_string(),
        })
    }

    /// Split, pad and map one raw TSV line.
    pub fn parse_line(
        line: &str,
        header_width: usize,
        sync_timestamp: &str,
    ) -> Result<Self, RowParseError> {
        let cells = split_padded(line, header_width);
        Self::from_cells(&cells, sync_timestamp)
    }

    /// Mapped values in [`COLUMN_MAP`] order, excluding the sync stamp.
    pub fn values(&self) -> [FieldValue<'_>; 38] {
        use FieldValue::{Integer, Real, Text};
        [
            Text(&self.order_number),
            Text(&self.order_date),
            Text(&self.payment_date),
            Text(&self.project_code),
            Text(&self.project_name),
            Text(&self.unit_no),
            Text(&self.house_number),
            Text(&self.unit_status),
            Text(&self.contact_name),
            Text(&self.contact_phone),
            Text(&self.product_type),
            Text(&self.product_group),
            Text(&self.items_group),
            Text(&self.product_detail),
            Text(&self.color),
            Text(&self.brand),
            Text(&self.product_size),
            Text(&self.room_type),
            Text(&self.install_point),
            Text(&self.install_size),
            Text(&self.supplier_name),
            Text(&self.po_number),
            Text(&self.po_date),
            Text(&self.install_confirm_date),
            Text(&self.install_time_slot),
            Text(&self.install_date),
            Text(&self.delivery_date),
            Text(&self.notes),
            Text(&self.document_status),
            Text(&self.install_status),
            Real(self.cost_total_ex_vat),
            Real(self.cost_total_in_vat),
            Real(self.sale_total_ex_vat),
            Real(self.sale_total_in_vat),
            Integer(self.sales_month),
            Integer(self.sales_year),
            Text(&self.building),
            Text(&self.floor_level),
        ]
    }
}

/// Split a line on tabs and pad with empty cells up to `width`.
pub fn split_padded(line: &str, width: usize) -> Vec<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut cells: Vec<&str> = line.split('\t').collect();
    if cells.len() < width {
        cells.resize(width, "");
    }
    cells
}

/// Number of header cells, ignoring a trailing carriage return.
pub fn header_width(header: &str) -> usize {
    split_padded(header, 0).len()
}

/// Best-effort float conversion: thousands separators are dropped, blank or
/// unparseable input is `None`.
pub fn coerce_float(raw: &str) -> Option<f64> {
    if raw.trim().is_empty() {
        return None;
    }
    let cleaned = raw.replace(',', "");
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| !value.is_nan())
}

/// Integer conversion through [`coerce_float`], truncating toward zero.
///
/// Values that parse but cannot be represented as `i64` are a row error
/// rather than a silent null.
pub fn coerce_int(raw: &str, column: usize) -> Result<Option<i64>, RowParseError> {
    let Some(value) = coerce_float(raw) else {
        return Ok(None);
    };
    let truncated = value.trunc();
    if !truncated.is_finite() || truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(RowParseError::IntegerOutOfRange {
            column,
            value: raw.to_string(),
        });
    }
    Ok(Some(truncated as i64))
}
