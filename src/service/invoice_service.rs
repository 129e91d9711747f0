use crate::module::invoice_job::model::{InvoiceLineItem, InvoiceRecord};
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;

/// Tolerant parser for the LLM's invoice reply.
///
/// Providers drift on field casing and locale formatting, so lookups ignore
/// case and separators, numbers accept comma or dot decimals with currency
/// symbols and thousands separators, and dates accept EU formats before ISO.
pub fn parse_invoice(value: &Value) -> Result<InvoiceRecord, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "invoice reply is not a JSON object".to_string())?;
    let fields = FieldMap::new(obj);

    let invoice_number = fields
        .string("invoiceNumber")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing invoiceNumber".to_string())?;
    let invoice_date = fields
        .raw("invoiceDate")
        .and_then(parse_date_value)
        .ok_or_else(|| "missing or unparseable invoiceDate".to_string())?;
    let vendor_name = fields
        .string("vendorName")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing vendorName".to_string())?;
    let currency = fields
        .string("currency")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| "EUR".to_string());

    let subtotal = fields
        .number("subtotal")
        .ok_or_else(|| "missing or unparseable subtotal".to_string())?;
    let tax = fields
        .number("tax")
        .ok_or_else(|| "missing or unparseable tax".to_string())?;
    let total = fields
        .number("total")
        .ok_or_else(|| "missing or unparseable total".to_string())?;

    // An unparseable due date degrades to absent rather than failing the job.
    let due_date = fields.raw("dueDate").and_then(parse_date_value);

    let mut line_items = Vec::new();
    if let Some(items) = fields.raw("lineItems").and_then(Value::as_array) {
        for item in items {
            if let Some(parsed) = parse_line_item(item) {
                line_items.push(parsed);
            }
        }
    }

    let notes = fields.string("notes").filter(|s| !s.is_empty());

    Ok(InvoiceRecord {
        invoice_number,
        invoice_date,
        vendor_name,
        currency,
        subtotal,
        tax,
        total,
        due_date,
        line_items,
        notes,
    })
}

fn parse_line_item(value: &Value) -> Option<InvoiceLineItem> {
    let obj = value.as_object()?;
    let fields = FieldMap::new(obj);
    let description = fields.string("description").unwrap_or_default();
    let quantity = fields.number("quantity").unwrap_or(0.0);
    let unit_price = fields.number("unitPrice").unwrap_or(0.0);
    let line_total = fields
        .number("lineTotal")
        .filter(|v| *v != 0.0)
        .unwrap_or(quantity * unit_price);
    Some(InvoiceLineItem {
        description,
        quantity,
        unit_price,
        line_total,
    })
}

/// Field lookup keyed on lowercased alphanumerics, so `invoiceNumber`,
/// `invoice_number`, and `InvoiceNumber` all resolve.
struct FieldMap<'a> {
    by_key: HashMap<String, &'a Value>,
}

impl<'a> FieldMap<'a> {
    fn new(obj: &'a serde_json::Map<String, Value>) -> Self {
        let mut by_key = HashMap::with_capacity(obj.len());
        for (k, v) in obj {
            by_key.entry(fold_key(k)).or_insert(v);
        }
        Self { by_key }
    }

    fn raw(&self, name: &str) -> Option<&'a Value> {
        self.by_key.get(&fold_key(name)).copied()
    }

    fn string(&self, name: &str) -> Option<String> {
        match self.raw(name)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn number(&self, name: &str) -> Option<f64> {
        parse_number_value(self.raw(name)?)
    }
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number_str(s),
        _ => None,
    }
}

/// Normalize a numeric string: drop currency symbols and spaces, resolve
/// comma-vs-dot decimals, strip thousands separators.
pub fn parse_number_str(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) => {
            // The rightmost separator is the decimal point.
            if comma > dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) => {
            // Comma-only: a single comma before a non-3-digit tail is a
            // decimal comma; anything else reads as thousands grouping.
            let parts: Vec<&str> = cleaned.split(',').collect();
            if parts.len() > 2 || (parts.len() == 2 && parts[1].len() == 3) {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };
    normalized.parse::<f64>().ok()
}

fn parse_date_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => parse_date_str(s),
        _ => None,
    }
}

/// Accept EU formats first, then ISO; emit ISO `yyyy-mm-dd`.
pub fn parse_date_str(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    for fmt in ["%d-%m-%Y", "%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// Column order for session exports; one row per line item with invoice
/// header fields repeated.
pub const CSV_COLUMNS: [&str; 15] = [
    "invoiceNumber",
    "invoiceDate",
    "vendorName",
    "currency",
    "subtotal",
    "tax",
    "total",
    "dueDate",
    "lineItemIndex",
    "description",
    "quantity",
    "unitPrice",
    "lineTotal",
    "confidenceScore",
    "filename",
];

pub fn csv_header() -> String {
    CSV_COLUMNS.join(",")
}

pub fn csv_rows(invoice: &InvoiceRecord, filename: &str, confidence: Option<f64>) -> Vec<String> {
    let confidence_cell = confidence.map(|c| c.to_string()).unwrap_or_default();
    invoice
        .line_items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let cells = [
                invoice.invoice_number.clone(),
                invoice.invoice_date.clone(),
                invoice.vendor_name.clone(),
                invoice.currency.clone(),
                invoice.subtotal.to_string(),
                invoice.tax.to_string(),
                invoice.total.to_string(),
                invoice.due_date.clone().unwrap_or_default(),
                (idx + 1).to_string(),
                item.description.clone(),
                item.quantity.to_string(),
                item.unit_price.to_string(),
                item.line_total.to_string(),
                confidence_cell.clone(),
                filename.to_string(),
            ];
            cells
                .iter()
                .map(|c| escape_csv_field(c))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_comma_decimals_and_currency_symbols() {
        assert_eq!(parse_number_str("1.234,56"), Some(1234.56));
        assert_eq!(parse_number_str("1,234.56"), Some(1234.56));
        assert_eq!(parse_number_str("€ 99,95"), Some(99.95));
        assert_eq!(parse_number_str("$1,000"), Some(1000.0));
        assert_eq!(parse_number_str("100.50"), Some(100.5));
        assert_eq!(parse_number_str("-12,5"), Some(-12.5));
        assert_eq!(parse_number_str("abc"), None);
    }

    #[test]
    fn parses_eu_and_iso_dates() {
        assert_eq!(parse_date_str("31-01-2026"), Some("2026-01-31".to_string()));
        assert_eq!(parse_date_str("2026-01-31"), Some("2026-01-31".to_string()));
        assert_eq!(parse_date_str("31/01/2026"), Some("2026-01-31".to_string()));
        assert_eq!(parse_date_str("31.01.2026"), Some("2026-01-31".to_string()));
        assert_eq!(parse_date_str("January 31"), None);
    }

    #[test]
    fn accepts_alternate_field_casings() {
        let value = json!({
            "invoice_number": "INV-001",
            "InvoiceDate": "05-02-2026",
            "vendorname": "ACME BV",
            "subtotal": "100,00",
            "tax": "21,00",
            "total": "121,00",
            "line_items": [
                {"description": "Widget", "quantity": 2, "unit_price": "50,00"}
            ]
        });
        let inv = parse_invoice(&value).unwrap();
        assert_eq!(inv.invoice_number, "INV-001");
        assert_eq!(inv.invoice_date, "2026-02-05");
        assert_eq!(inv.currency, "EUR");
        assert_eq!(inv.subtotal, 100.0);
        // lineTotal backfilled from quantity x unitPrice.
        assert_eq!(inv.line_items[0].line_total, 100.0);
    }

    #[test]
    fn unparseable_due_date_degrades_to_none() {
        let value = json!({
            "invoiceNumber": "INV-2",
            "invoiceDate": "2026-01-01",
            "vendorName": "V",
            "subtotal": 1, "tax": 0, "total": 1,
            "dueDate": "soon",
            "lineItems": []
        });
        let inv = parse_invoice(&value).unwrap();
        assert!(inv.due_date.is_none());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let value = json!({
            "invoiceDate": "2026-01-01",
            "vendorName": "V",
            "subtotal": 1, "tax": 0, "total": 1,
            "lineItems": []
        });
        assert!(parse_invoice(&value).is_err());
    }

    #[test]
    fn csv_escapes_commas_and_quotes() {
        let inv = InvoiceRecord {
            invoice_number: "INV-3".to_string(),
            invoice_date: "2026-01-01".to_string(),
            vendor_name: "ACME, \"BV\"".to_string(),
            currency: "EUR".to_string(),
            subtotal: 10.0,
            tax: 2.1,
            total: 12.1,
            due_date: None,
            line_items: vec![crate::module::invoice_job::model::InvoiceLineItem {
                description: "bolts, zinc".to_string(),
                quantity: 1.0,
                unit_price: 10.0,
                line_total: 10.0,
            }],
            notes: None,
        };
        let rows = csv_rows(&inv, "a.pdf", Some(0.9));
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains("\"ACME, \"\"BV\"\"\""));
        assert!(rows[0].contains("\"bolts, zinc\""));
        assert!(rows[0].starts_with("INV-3,2026-01-01"));
    }
}
