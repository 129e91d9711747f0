pub mod invoice_job;
