//! CSV and Excel export for gems, segments, and profiles.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::store::{GemFilter, Store, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("xlsx write failed: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Excel,
}

const PROFILE_COLUMNS: [&str; 19] = [
    "sender_domain",
    "company_name",
    "primary_email",
    "reply_to_email",
    "industry",
    "company_size",
    "marketing_sophistication_avg",
    "marketing_sophistication_trend",
    "esp_used",
    "product_type",
    "product_description",
    "target_audience",
    "total_messages",
    "first_contact",
    "last_contact",
    "avg_frequency_days",
    "has_personalization",
    "has_partner_program",
    "authentication_quality",
];

pub fn export_gems(store: &Store, output: &Path) -> Result<PathBuf, ExportError> {
    let gems = store.list_gems(&GemFilter::default())?;
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record([
        "id",
        "gem_type",
        "sender_domain",
        "company_name",
        "industry",
        "company_size",
        "score",
        "summary",
        "estimated_value",
        "urgency",
        "recommended_actions",
        "status",
    ])?;
    for gem in gems {
        let profile = store.get_profile(&gem.sender_domain)?;
        writer.write_record([
            gem.id.to_string(),
            gem.gem_type.to_string(),
            gem.sender_domain.clone(),
            profile.as_ref().map(|p| p.company_name.clone()).unwrap_or_default(),
            profile.as_ref().map(|p| p.industry.clone()).unwrap_or_default(),
            profile.as_ref().map(|p| p.company_size.clone()).unwrap_or_default(),
            gem.score.to_string(),
            gem.explanation.summary.clone(),
            gem.explanation.estimated_value.clone(),
            gem.explanation.urgency.clone(),
            gem.recommended_actions.join("; "),
            gem.status.to_string(),
        ])?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(output.to_path_buf())
}

pub fn export_segment(store: &Store, segment: &str, output: &Path) -> Result<PathBuf, ExportError> {
    let rows = store.list_segments(Some(segment))?;
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record([
        "sender_domain",
        "company_name",
        "primary_email",
        "industry",
        "company_size",
        "marketing_sophistication",
        "esp_used",
        "product_description",
        "total_messages",
        "segment",
        "sub_segment",
        "confidence",
    ])?;
    for row in rows {
        let profile = store.get_profile(&row.sender_domain)?;
        writer.write_record([
            row.sender_domain.clone(),
            profile.as_ref().map(|p| p.company_name.clone()).unwrap_or_default(),
            profile.as_ref().map(|p| p.primary_email.clone()).unwrap_or_default(),
            profile.as_ref().map(|p| p.industry.clone()).unwrap_or_default(),
            profile.as_ref().map(|p| p.company_size.clone()).unwrap_or_default(),
            profile
                .as_ref()
                .map(|p| format!("{:.1}", p.marketing_sophistication_avg))
                .unwrap_or_default(),
            profile
                .as_ref()
                .and_then(|p| p.esp_used.clone())
                .unwrap_or_default(),
            profile
                .as_ref()
                .map(|p| p.product_description.clone())
                .unwrap_or_default(),
            profile
                .as_ref()
                .map(|p| p.total_messages.to_string())
                .unwrap_or_default(),
            row.segment.clone(),
            row.sub_segment.clone(),
            format!("{:.2}", row.confidence),
        ])?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(output.to_path_buf())
}

pub fn export_profiles(
    store: &Store,
    output: &Path,
    format: ExportFormat,
) -> Result<PathBuf, ExportError> {
    let profiles = store.list_profiles()?;
    let rows: Vec<Vec<String>> = profiles
        .iter()
        .map(|p| {
            vec![
                p.sender_domain.clone(),
                p.company_name.clone(),
                p.primary_email.clone(),
                p.reply_to_email.clone().unwrap_or_default(),
                p.industry.clone(),
                p.company_size.clone(),
                format!("{:.1}", p.marketing_sophistication_avg),
                p.marketing_sophistication_trend.clone(),
                p.esp_used.clone().unwrap_or_default(),
                p.product_type.clone(),
                p.product_description.clone(),
                p.target_audience.clone(),
                p.total_messages.to_string(),
                p.first_contact.clone().unwrap_or_default(),
                p.last_contact.clone().unwrap_or_default(),
                p.avg_frequency_days
                    .map(|v| format!("{v:.1}"))
                    .unwrap_or_default(),
                p.has_personalization.to_string(),
                p.has_partner_program.to_string(),
                p.authentication_quality.clone(),
            ]
        })
        .collect();

    match format {
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(output)?;
            writer.write_record(PROFILE_COLUMNS)?;
            for row in rows {
                writer.write_record(&row)?;
            }
            writer.flush().map_err(|source| ExportError::Io {
                path: output.to_path_buf(),
                source,
            })?;
            Ok(output.to_path_buf())
        }
        ExportFormat::Excel => {
            let path = if output.extension().is_some_and(|ext| ext == "xlsx") {
                output.to_path_buf()
            } else {
                output.with_extension("xlsx")
            };
            let mut workbook = rust_xlsxwriter::Workbook::new();
            let worksheet = workbook.add_worksheet();
            worksheet.set_name("Sender Profiles")?;
            for (col, name) in PROFILE_COLUMNS.iter().enumerate() {
                worksheet.write_string(0, col as u16, *name)?;
            }
            for (row_idx, row) in rows.iter().enumerate() {
                for (col_idx, value) in row.iter().enumerate() {
                    worksheet.write_string(row_idx as u32 + 1, col_idx as u16, value)?;
                }
            }
            workbook.save(&path)?;
            Ok(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GemExplanation, GemSignal, GemType, NewGem, SenderProfile, SenderSegment};

    fn seeded_store() -> Store {
        let store = Store::in_memory().expect("store");
        store
            .upsert_profile(&SenderProfile {
                sender_domain: "acme.com".to_string(),
                company_name: "Acme".to_string(),
                industry: "SaaS".to_string(),
                company_size: "small".to_string(),
                total_messages: 4,
                ..SenderProfile::default()
            })
            .expect("profile");
        store
            .insert_gem(&NewGem {
                gem_type: GemType::PartnerProgram,
                sender_domain: "acme.com".to_string(),
                thread_id: None,
                score: 45,
                explanation: GemExplanation {
                    gem_type: GemType::PartnerProgram,
                    summary: "Partner program".to_string(),
                    signals: vec![GemSignal::evidence("partner_program_detected", "links")],
                    confidence: 0.8,
                    estimated_value: "medium".to_string(),
                    urgency: "low".to_string(),
                },
                recommended_actions: vec!["Apply".to_string()],
                source_message_ids: Vec::new(),
            })
            .expect("gem");
        store
            .upsert_segment(&SenderSegment {
                sender_domain: "acme.com".to_string(),
                segment: "partner_map".to_string(),
                sub_segment: "referral_program".to_string(),
                confidence: 0.8,
            })
            .expect("segment");
        store
    }

    #[test]
    fn gems_export_includes_profile_columns() {
        let store = seeded_store();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gems.csv");
        export_gems(&store, &path).expect("export");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.starts_with("id,gem_type,sender_domain"));
        assert!(raw.contains("partner_program"));
        assert!(raw.contains("Acme"));
    }

    #[test]
    fn segment_export_filters_to_one_segment() {
        let store = seeded_store();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partner.csv");
        export_segment(&store, "partner_map", &path).expect("export");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("referral_program"));

        let empty = dir.path().join("empty.csv");
        export_segment(&store, "spend_map", &empty).expect("export");
        let raw = std::fs::read_to_string(&empty).expect("read");
        assert_eq!(raw.lines().count(), 1, "header only");
    }

    #[test]
    fn profile_export_writes_both_formats() {
        let store = seeded_store();
        let dir = tempfile::tempdir().expect("tempdir");

        let csv_path = dir.path().join("profiles.csv");
        export_profiles(&store, &csv_path, ExportFormat::Csv).expect("csv");
        let raw = std::fs::read_to_string(&csv_path).expect("read");
        assert!(raw.contains("acme.com"));

        let xlsx_path = dir.path().join("profiles.out");
        let written = export_profiles(&store, &xlsx_path, ExportFormat::Excel).expect("xlsx");
        assert_eq!(written.extension().and_then(|e| e.to_str()), Some("xlsx"));
        assert!(written.exists());
    }
}
