use crate::module::invoice_job::model::InvoiceRecord;

/// Weighted confidence over four signals: OCR quality, structural validity,
/// arithmetic consistency, and field coverage (0.4 / 0.3 / 0.2 / 0.1).
///
/// Per-word OCR confidences are not uniformly available across provider
/// tiers, so `ocr_quality` defaults to 1.0 when absent.
pub fn compute_confidence(invoice: &InvoiceRecord, ocr_quality: Option<f64>) -> f64 {
    let ocr_quality = ocr_quality.unwrap_or(1.0).clamp(0.0, 1.0);

    // A parsed record implies the required fields survived validation.
    let llm_validity = 1.0;

    let sum_lines: f64 = invoice.line_items.iter().map(|li| li.line_total).sum();
    let c1 = closeness(invoice.subtotal + invoice.tax, invoice.total);
    let c2 = closeness(invoice.subtotal, sum_lines);
    let consistency = (c1 + c2) / 2.0;

    let mut fields_present = 0u32;
    let total_fields = 8u32;
    fields_present += u32::from(!invoice.invoice_number.is_empty());
    fields_present += u32::from(!invoice.invoice_date.is_empty());
    fields_present += u32::from(!invoice.vendor_name.is_empty());
    fields_present += u32::from(!invoice.currency.is_empty());
    fields_present += u32::from(invoice.subtotal.is_finite());
    fields_present += u32::from(invoice.tax.is_finite());
    fields_present += u32::from(invoice.total.is_finite());
    fields_present += u32::from(!invoice.line_items.is_empty());
    let coverage = f64::from(fields_present) / f64::from(total_fields);

    let score =
        (0.4 * ocr_quality + 0.3 * llm_validity + 0.2 * consistency + 0.1 * coverage).clamp(0.0, 1.0);
    (score * 1000.0).round() / 1000.0
}

fn closeness(expected: f64, actual: f64) -> f64 {
    if expected <= 0.0 {
        return 0.0;
    }
    (1.0 - ((actual - expected).abs() / expected).min(1.0)).max(0.0)
}
