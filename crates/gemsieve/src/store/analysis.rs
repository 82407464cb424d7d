//! Analysis-side repositories: header metadata, parsed content, entities,
//! AI classifications, and classification overrides.
//!
//! Every stage reads its upstream table with a left-anti-join against its
//! own output, so only unprocessed rows come back.

use std::collections::{HashMap, HashSet};

use rusqlite::{OptionalExtension, Row, params};

use crate::models::{
    Classification, ClassificationOverride, EntitySource, EntityType, ExtractedEntity, Message,
    OverrideScope, ParsedContent, ParsedMetadata, SenderTemporal,
};
use crate::store::{Store, StoreError, from_json_or_default, parse_enum, to_json};

/// Joined row handed to the classify stage: one per unclassified message.
#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub message_id: String,
    pub sender_domain: String,
    pub from_address: String,
    pub from_name: String,
    pub subject: String,
    pub esp_identified: Option<String>,
    pub body_clean: String,
    pub cta_texts: Vec<String>,
    pub offer_types: Vec<String>,
}

impl Store {
    // ------------------------------------------------------------------
    // parsed_metadata
    // ------------------------------------------------------------------

    pub fn messages_without_metadata(&self) -> Result<Vec<Message>, StoreError> {
        self.messages_without_output("parsed_metadata")
    }

    pub fn upsert_parsed_metadata(&self, meta: &ParsedMetadata) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO parsed_metadata (
                 message_id, sender_domain, sender_subdomain, envelope_sender,
                 esp_identified, esp_confidence, dkim_domain, spf_result,
                 dmarc_result, sending_ip, mail_server, x_mailer, precedence,
                 feedback_id, list_unsubscribe_url, list_unsubscribe_email, is_bulk
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(message_id) DO UPDATE SET
                 sender_domain = excluded.sender_domain,
                 sender_subdomain = excluded.sender_subdomain,
                 envelope_sender = excluded.envelope_sender,
                 esp_identified = excluded.esp_identified,
                 esp_confidence = excluded.esp_confidence,
                 dkim_domain = excluded.dkim_domain,
                 spf_result = excluded.spf_result,
                 dmarc_result = excluded.dmarc_result,
                 sending_ip = excluded.sending_ip,
                 mail_server = excluded.mail_server,
                 x_mailer = excluded.x_mailer,
                 precedence = excluded.precedence,
                 feedback_id = excluded.feedback_id,
                 list_unsubscribe_url = excluded.list_unsubscribe_url,
                 list_unsubscribe_email = excluded.list_unsubscribe_email,
                 is_bulk = excluded.is_bulk",
            params![
                meta.message_id,
                meta.sender_domain,
                meta.sender_subdomain,
                meta.envelope_sender,
                meta.esp_identified,
                meta.esp_confidence,
                meta.dkim_domain,
                meta.spf_result,
                meta.dmarc_result,
                meta.sending_ip,
                meta.mail_server,
                meta.x_mailer,
                meta.precedence,
                meta.feedback_id,
                meta.list_unsubscribe_url,
                meta.list_unsubscribe_email,
                meta.is_bulk,
            ],
        )?;
        Ok(())
    }

    pub fn get_parsed_metadata(&self, message_id: &str) -> Result<Option<ParsedMetadata>, StoreError> {
        self.conn()
            .query_row(
                "SELECT message_id, sender_domain, sender_subdomain, envelope_sender,
                        esp_identified, esp_confidence, dkim_domain, spf_result,
                        dmarc_result, sending_ip, mail_server, x_mailer, precedence,
                        feedback_id, list_unsubscribe_url, list_unsubscribe_email, is_bulk
                 FROM parsed_metadata WHERE message_id = ?1",
                params![message_id],
                map_metadata,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn metadata_for_domain(&self, domain: &str) -> Result<Option<ParsedMetadata>, StoreError> {
        self.conn()
            .query_row(
                "SELECT message_id, sender_domain, sender_subdomain, envelope_sender,
                        esp_identified, esp_confidence, dkim_domain, spf_result,
                        dmarc_result, sending_ip, mail_server, x_mailer, precedence,
                        feedback_id, list_unsubscribe_url, list_unsubscribe_email, is_bulk
                 FROM parsed_metadata WHERE sender_domain = ?1 LIMIT 1",
                params![domain],
                map_metadata,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn sender_domains(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT sender_domain FROM parsed_metadata WHERE sender_domain != ''",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// (domain, message date) pairs ordered by domain then date, feeding the
    /// temporal rollup.
    pub fn message_dates_by_domain(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT pm.sender_domain, m.date
             FROM parsed_metadata pm
             JOIN messages m ON pm.message_id = m.message_id
             WHERE pm.sender_domain != '' AND m.date IS NOT NULL
             ORDER BY pm.sender_domain, m.date",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn upsert_sender_temporal(&self, temporal: &SenderTemporal) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sender_temporal (
                 sender_domain, first_seen, last_seen, total_messages,
                 avg_frequency_days, most_common_send_hour, most_common_send_day
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(sender_domain) DO UPDATE SET
                 first_seen = excluded.first_seen,
                 last_seen = excluded.last_seen,
                 total_messages = excluded.total_messages,
                 avg_frequency_days = excluded.avg_frequency_days,
                 most_common_send_hour = excluded.most_common_send_hour,
                 most_common_send_day = excluded.most_common_send_day",
            params![
                temporal.sender_domain,
                temporal.first_seen,
                temporal.last_seen,
                temporal.total_messages,
                temporal.avg_frequency_days,
                temporal.most_common_send_hour,
                temporal.most_common_send_day,
            ],
        )?;
        Ok(())
    }

    pub fn get_sender_temporal(&self, domain: &str) -> Result<Option<SenderTemporal>, StoreError> {
        self.conn()
            .query_row(
                "SELECT sender_domain, first_seen, last_seen, total_messages,
                        avg_frequency_days, most_common_send_hour, most_common_send_day
                 FROM sender_temporal WHERE sender_domain = ?1",
                params![domain],
                |row| {
                    Ok(SenderTemporal {
                        sender_domain: row.get(0)?,
                        first_seen: row.get(1)?,
                        last_seen: row.get(2)?,
                        total_messages: row.get(3)?,
                        avg_frequency_days: row.get(4)?,
                        most_common_send_hour: row.get(5)?,
                        most_common_send_day: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Domains where more than half the messages look like bulk mail.
    pub fn bulk_sender_domains(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT sender_domain
             FROM parsed_metadata
             WHERE sender_domain != ''
             GROUP BY sender_domain
             HAVING SUM(is_bulk) * 1.0 / COUNT(*) > 0.5",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>()
            .map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // parsed_content
    // ------------------------------------------------------------------

    pub fn messages_without_content(&self) -> Result<Vec<Message>, StoreError> {
        self.messages_without_output("parsed_content")
    }

    pub fn upsert_parsed_content(&self, content: &ParsedContent) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO parsed_content (
                 message_id, body_clean, signature_block, footer_block,
                 primary_headline, cta_texts, offer_types, has_personalization,
                 personalization_tokens, link_count, tracking_pixel_count,
                 unique_link_domains, link_intents, utm_campaigns,
                 has_physical_address, physical_address_text, social_links,
                 image_count, template_complexity_score
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(message_id) DO UPDATE SET
                 body_clean = excluded.body_clean,
                 signature_block = excluded.signature_block,
                 footer_block = excluded.footer_block,
                 primary_headline = excluded.primary_headline,
                 cta_texts = excluded.cta_texts,
                 offer_types = excluded.offer_types,
                 has_personalization = excluded.has_personalization,
                 personalization_tokens = excluded.personalization_tokens,
                 link_count = excluded.link_count,
                 tracking_pixel_count = excluded.tracking_pixel_count,
                 unique_link_domains = excluded.unique_link_domains,
                 link_intents = excluded.link_intents,
                 utm_campaigns = excluded.utm_campaigns,
                 has_physical_address = excluded.has_physical_address,
                 physical_address_text = excluded.physical_address_text,
                 social_links = excluded.social_links,
                 image_count = excluded.image_count,
                 template_complexity_score = excluded.template_complexity_score",
            params![
                content.message_id,
                content.body_clean,
                content.signature_block,
                content.footer_block,
                content.primary_headline,
                to_json(&content.cta_texts)?,
                to_json(&content.offer_types)?,
                content.has_personalization,
                to_json(&content.personalization_tokens)?,
                content.link_count,
                content.tracking_pixel_count,
                to_json(&content.unique_link_domains)?,
                to_json(&content.link_intents)?,
                to_json(&content.utm_campaigns)?,
                content.has_physical_address,
                content.physical_address_text,
                to_json(&content.social_links)?,
                content.image_count,
                content.template_complexity_score,
            ],
        )?;
        Ok(())
    }

    pub fn get_parsed_content(&self, message_id: &str) -> Result<Option<ParsedContent>, StoreError> {
        self.conn()
            .query_row(
                &format!("{CONTENT_SELECT} WHERE message_id = ?1"),
                params![message_id],
                map_content,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn contents_for_domain(&self, domain: &str) -> Result<Vec<ParsedContent>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{CONTENT_SELECT} WHERE message_id IN (
                 SELECT message_id FROM parsed_metadata WHERE sender_domain = ?1
             )"
        ))?;
        let rows = stmt.query_map(params![domain], map_content)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Clean bodies of inbound (not user-sent) messages for a domain.
    pub fn inbound_bodies_for_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT pc.body_clean
             FROM parsed_content pc
             JOIN parsed_metadata pm ON pc.message_id = pm.message_id
             JOIN messages m ON pc.message_id = m.message_id
             WHERE pm.sender_domain = ?1 AND m.is_sent = 0
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // extracted_entities
    // ------------------------------------------------------------------

    /// Messages with parsed content but no extracted entities yet.
    pub fn messages_without_entities(&self) -> Result<Vec<(Message, ParsedContent)>, StoreError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT pc.message_id
                 FROM parsed_content pc
                 LEFT JOIN extracted_entities ee ON pc.message_id = ee.message_id
                 WHERE ee.message_id IS NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let message = self.get_message(&id)?;
            let content = self.get_parsed_content(&id)?;
            if let (Some(message), Some(content)) = (message, content) {
                out.push((message, content));
            }
        }
        Ok(out)
    }

    /// Replace the entity set for a message in one transaction, keeping
    /// re-runs duplicate-free.
    pub fn replace_entities(
        &self,
        message_id: &str,
        entities: &[ExtractedEntity],
    ) -> Result<(), StoreError> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM extracted_entities WHERE message_id = ?1",
            params![message_id],
        )?;
        for entity in entities {
            tx.execute(
                "INSERT INTO extracted_entities (
                     message_id, entity_type, entity_value, entity_normalized,
                     context, confidence, source
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.message_id,
                    entity.entity_type.to_string(),
                    entity.entity_value,
                    entity.entity_normalized,
                    entity.context,
                    entity.confidence,
                    entity.source.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn entities_for_messages(
        &self,
        message_ids: &[String],
    ) -> Result<Vec<ExtractedEntity>, StoreError> {
        let mut out = Vec::new();
        for id in message_ids {
            out.extend(self.entities_for_message(id)?);
        }
        Ok(out)
    }

    pub fn entities_for_message(&self, message_id: &str) -> Result<Vec<ExtractedEntity>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{ENTITY_SELECT} WHERE message_id = ?1 ORDER BY confidence DESC"
        ))?;
        let rows = stmt.query_map(params![message_id], map_entity)?;
        collect_entities(rows)
    }

    pub fn entities_for_domain(&self, domain: &str) -> Result<Vec<ExtractedEntity>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{ENTITY_SELECT} WHERE message_id IN (
                 SELECT message_id FROM parsed_metadata WHERE sender_domain = ?1
             )"
        ))?;
        let rows = stmt.query_map(params![domain], map_entity)?;
        collect_entities(rows)
    }

    pub fn entities_for_thread(&self, thread_id: &str) -> Result<Vec<ExtractedEntity>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{ENTITY_SELECT} WHERE message_id IN (
                 SELECT message_id FROM messages WHERE thread_id = ?1
             )"
        ))?;
        let rows = stmt.query_map(params![thread_id], map_entity)?;
        collect_entities(rows)
    }

    // ------------------------------------------------------------------
    // ai_classification
    // ------------------------------------------------------------------

    /// Unclassified messages joined with their metadata and content, ordered
    /// by sender domain then newest first.
    pub fn unclassified_messages(&self) -> Result<Vec<ClassifyInput>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT m.message_id, pm.sender_domain, m.from_address, m.from_name,
                    m.subject, pm.esp_identified, pc.body_clean, pc.cta_texts,
                    pc.offer_types
             FROM messages m
             JOIN parsed_metadata pm ON m.message_id = pm.message_id
             LEFT JOIN parsed_content pc ON m.message_id = pc.message_id
             LEFT JOIN ai_classification ac ON m.message_id = ac.message_id
             WHERE ac.message_id IS NULL AND pm.sender_domain != ''
             ORDER BY pm.sender_domain, m.date DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClassifyInput {
                message_id: row.get(0)?,
                sender_domain: row.get(1)?,
                from_address: row.get(2)?,
                from_name: row.get(3)?,
                subject: row.get(4)?,
                esp_identified: row.get(5)?,
                body_clean: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                cta_texts: from_json_or_default(row.get(7)?),
                offer_types: from_json_or_default(row.get(8)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn upsert_classification(&self, class: &Classification) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO ai_classification (
                 message_id, industry, company_size_estimate,
                 marketing_sophistication, sender_intent, product_type,
                 product_description, pain_points, target_audience,
                 partner_program_detected, renewal_signal_detected,
                 ai_confidence, model_used, has_override
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(message_id) DO UPDATE SET
                 industry = excluded.industry,
                 company_size_estimate = excluded.company_size_estimate,
                 marketing_sophistication = excluded.marketing_sophistication,
                 sender_intent = excluded.sender_intent,
                 product_type = excluded.product_type,
                 product_description = excluded.product_description,
                 pain_points = excluded.pain_points,
                 target_audience = excluded.target_audience,
                 partner_program_detected = excluded.partner_program_detected,
                 renewal_signal_detected = excluded.renewal_signal_detected,
                 ai_confidence = excluded.ai_confidence,
                 model_used = excluded.model_used,
                 has_override = excluded.has_override",
            params![
                class.message_id,
                class.industry,
                class.company_size_estimate,
                class.marketing_sophistication,
                class.sender_intent,
                class.product_type,
                class.product_description,
                to_json(&class.pain_points)?,
                class.target_audience,
                class.partner_program_detected,
                class.renewal_signal_detected,
                class.ai_confidence,
                class.model_used,
                class.has_override,
            ],
        )?;
        Ok(())
    }

    pub fn get_classification(&self, message_id: &str) -> Result<Option<Classification>, StoreError> {
        self.conn()
            .query_row(
                &format!("{CLASSIFICATION_SELECT} WHERE message_id = ?1"),
                params![message_id],
                map_classification,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Classifications for a domain in message-date order, so the caller's
    /// "most recent" pick is well defined.
    pub fn classifications_for_domain(&self, domain: &str) -> Result<Vec<Classification>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT ac.message_id, ac.industry, ac.company_size_estimate,
                    ac.marketing_sophistication, ac.sender_intent, ac.product_type,
                    ac.product_description, ac.pain_points, ac.target_audience,
                    ac.partner_program_detected, ac.renewal_signal_detected,
                    ac.ai_confidence, ac.model_used, ac.has_override
             FROM ai_classification ac
             JOIN parsed_metadata pm ON ac.message_id = pm.message_id
             JOIN messages m ON ac.message_id = m.message_id
             WHERE pm.sender_domain = ?1
             ORDER BY m.date",
        )?;
        let rows = stmt.query_map(params![domain], map_classification)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn intents_for_thread(&self, thread_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT ac.sender_intent
             FROM ai_classification ac
             JOIN messages m ON ac.message_id = m.message_id
             WHERE m.thread_id = ?1 AND ac.sender_intent != ''",
        )?;
        let rows = stmt.query_map(params![thread_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn count_intent_for_domain(&self, domain: &str, intent: &str) -> Result<i64, StoreError> {
        self.conn()
            .query_row(
                "SELECT COUNT(*)
                 FROM ai_classification ac
                 JOIN parsed_metadata pm ON ac.message_id = pm.message_id
                 WHERE pm.sender_domain = ?1 AND ac.sender_intent = ?2",
                params![domain, intent],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // classification_overrides
    // ------------------------------------------------------------------

    pub fn add_override(
        &self,
        field_name: &str,
        corrected_value: &str,
        sender_domain: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let scope = if sender_domain.is_some() {
            OverrideScope::Sender
        } else {
            OverrideScope::Message
        };

        // Resolve the domain for message-scope rows so sender-level queries
        // still see them.
        let resolved_domain = match (sender_domain, message_id) {
            (Some(domain), _) => Some(domain.to_string()),
            (None, Some(id)) => self.get_parsed_metadata(id)?.map(|m| m.sender_domain),
            (None, None) => None,
        };

        let original_value = match message_id {
            Some(id) => self
                .get_classification(id)?
                .map(|c| classification_field(&c, field_name)),
            None => match sender_domain {
                Some(domain) => self
                    .classifications_for_domain(domain)?
                    .first()
                    .map(|c| classification_field(c, field_name)),
                None => None,
            },
        }
        .flatten();

        self.conn().execute(
            "INSERT INTO classification_overrides (
                 message_id, sender_domain, field_name, original_value,
                 corrected_value, override_scope
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message_id,
                resolved_domain,
                field_name,
                original_value,
                corrected_value,
                scope.to_string(),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Latest override value per field for a sender domain.
    pub fn sender_overrides(&self, domain: &str) -> Result<HashMap<String, String>, StoreError> {
        self.collect_overrides(
            "SELECT field_name, corrected_value FROM classification_overrides
             WHERE sender_domain = ?1 AND override_scope = 'sender'
             ORDER BY created_at DESC, id DESC",
            domain,
        )
    }

    /// Latest override value per field for a single message.
    pub fn message_overrides(&self, message_id: &str) -> Result<HashMap<String, String>, StoreError> {
        self.collect_overrides(
            "SELECT field_name, corrected_value FROM classification_overrides
             WHERE message_id = ?1 AND override_scope = 'message'
             ORDER BY created_at DESC, id DESC",
            message_id,
        )
    }

    fn collect_overrides(&self, sql: &str, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (field, value) = row?;
            // Rows arrive newest first; keep the first value per field.
            out.entry(field).or_insert(value);
        }
        Ok(out)
    }

    pub fn list_overrides(&self) -> Result<Vec<ClassificationOverride>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{OVERRIDE_SELECT} ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], map_override)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn recent_overrides(&self, limit: usize) -> Result<Vec<ClassificationOverride>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "{OVERRIDE_SELECT} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_override)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Per-field override counts against total classifications; fields above
    /// a 20% override rate are flagged for prompt tuning.
    pub fn override_stats(&self) -> Result<Vec<(String, i64, i64, f64)>, StoreError> {
        let total: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM ai_classification", [], |row| {
                    row.get(0)
                })?;
        let mut stmt = self.conn().prepare(
            "SELECT field_name, COUNT(*) FROM classification_overrides GROUP BY field_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (field, count) = row?;
            let rate = if total > 0 {
                count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            out.push((field, count, total, rate));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // domain_exclusions
    // ------------------------------------------------------------------

    pub fn excluded_domains(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn().prepare("SELECT domain FROM domain_exclusions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>()
            .map_err(StoreError::from)
    }

    pub fn add_domain_exclusion(&self, domain: &str, reason: Option<&str>) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO domain_exclusions (domain, reason) VALUES (?1, ?2)",
            params![domain, reason],
        )?;
        Ok(())
    }

    fn messages_without_output(&self, output_table: &str) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT m.message_id, m.thread_id, m.date, m.from_address, m.from_name,
                    m.reply_to, m.to_addresses, m.cc_addresses, m.subject,
                    m.headers_raw, m.body_html, m.body_text, m.labels, m.snippet,
                    m.size_estimate, m.is_sent
             FROM messages m
             LEFT JOIN {output_table} o ON m.message_id = o.message_id
             WHERE o.message_id IS NULL"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(Message {
                message_id: row.get(0)?,
                thread_id: row.get(1)?,
                date: row.get(2)?,
                from_address: row.get(3)?,
                from_name: row.get(4)?,
                reply_to: row.get(5)?,
                to_addresses: from_json_or_default(row.get(6)?),
                cc_addresses: from_json_or_default(row.get(7)?),
                subject: row.get(8)?,
                headers_raw: from_json_or_default(row.get(9)?),
                body_html: row.get(10)?,
                body_text: row.get(11)?,
                labels: from_json_or_default(row.get(12)?),
                snippet: row.get(13)?,
                size_estimate: row.get(14)?,
                is_sent: row.get(15)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn classification_field(class: &Classification, field: &str) -> Option<String> {
    match field {
        "industry" => Some(class.industry.clone()),
        "company_size_estimate" => Some(class.company_size_estimate.clone()),
        "marketing_sophistication" => Some(class.marketing_sophistication.to_string()),
        "sender_intent" => Some(class.sender_intent.clone()),
        "product_type" => Some(class.product_type.clone()),
        "product_description" => Some(class.product_description.clone()),
        "target_audience" => Some(class.target_audience.clone()),
        _ => None,
    }
}

const CONTENT_SELECT: &str = "SELECT message_id, body_clean, signature_block, footer_block, \
     primary_headline, cta_texts, offer_types, has_personalization, \
     personalization_tokens, link_count, tracking_pixel_count, \
     unique_link_domains, link_intents, utm_campaigns, has_physical_address, \
     physical_address_text, social_links, image_count, \
     template_complexity_score FROM parsed_content";

const ENTITY_SELECT: &str = "SELECT message_id, entity_type, entity_value, entity_normalized, \
     context, confidence, source FROM extracted_entities";

const CLASSIFICATION_SELECT: &str = "SELECT message_id, industry, company_size_estimate, \
     marketing_sophistication, sender_intent, product_type, \
     product_description, pain_points, target_audience, \
     partner_program_detected, renewal_signal_detected, ai_confidence, \
     model_used, has_override FROM ai_classification";

const OVERRIDE_SELECT: &str = "SELECT id, message_id, sender_domain, field_name, original_value, \
     corrected_value, override_scope, created_at FROM classification_overrides";

fn map_metadata(row: &Row<'_>) -> rusqlite::Result<ParsedMetadata> {
    Ok(ParsedMetadata {
        message_id: row.get(0)?,
        sender_domain: row.get(1)?,
        sender_subdomain: row.get(2)?,
        envelope_sender: row.get(3)?,
        esp_identified: row.get(4)?,
        esp_confidence: row.get(5)?,
        dkim_domain: row.get(6)?,
        spf_result: row.get(7)?,
        dmarc_result: row.get(8)?,
        sending_ip: row.get(9)?,
        mail_server: row.get(10)?,
        x_mailer: row.get(11)?,
        precedence: row.get(12)?,
        feedback_id: row.get(13)?,
        list_unsubscribe_url: row.get(14)?,
        list_unsubscribe_email: row.get(15)?,
        is_bulk: row.get(16)?,
    })
}

fn map_content(row: &Row<'_>) -> rusqlite::Result<ParsedContent> {
    Ok(ParsedContent {
        message_id: row.get(0)?,
        body_clean: row.get(1)?,
        signature_block: row.get(2)?,
        footer_block: row.get(3)?,
        primary_headline: row.get(4)?,
        cta_texts: from_json_or_default(row.get(5)?),
        offer_types: from_json_or_default(row.get(6)?),
        has_personalization: row.get(7)?,
        personalization_tokens: from_json_or_default(row.get(8)?),
        link_count: row.get(9)?,
        tracking_pixel_count: row.get(10)?,
        unique_link_domains: from_json_or_default(row.get(11)?),
        link_intents: from_json_or_default(row.get(12)?),
        utm_campaigns: from_json_or_default(row.get(13)?),
        has_physical_address: row.get(14)?,
        physical_address_text: row.get(15)?,
        social_links: from_json_or_default(row.get(16)?),
        image_count: row.get(17)?,
        template_complexity_score: row.get(18)?,
    })
}

fn map_entity(row: &Row<'_>) -> rusqlite::Result<(ExtractedEntityRaw, f64)> {
    Ok((
        ExtractedEntityRaw {
            message_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_value: row.get(2)?,
            entity_normalized: row.get(3)?,
            context: row.get(4)?,
            source: row.get(6)?,
        },
        row.get(5)?,
    ))
}

struct ExtractedEntityRaw {
    message_id: String,
    entity_type: String,
    entity_value: String,
    entity_normalized: Option<String>,
    context: Option<String>,
    source: String,
}

fn collect_entities<'a>(
    rows: rusqlite::MappedRows<'a, impl FnMut(&Row<'_>) -> rusqlite::Result<(ExtractedEntityRaw, f64)>>,
) -> Result<Vec<ExtractedEntity>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        let (raw, confidence) = row?;
        out.push(ExtractedEntity {
            message_id: raw.message_id,
            entity_type: parse_enum::<EntityType>("entity_type", raw.entity_type)?,
            entity_value: raw.entity_value,
            entity_normalized: raw.entity_normalized,
            context: raw.context,
            confidence,
            source: parse_enum::<EntitySource>("source", raw.source)?,
        });
    }
    Ok(out)
}

fn map_classification(row: &Row<'_>) -> rusqlite::Result<Classification> {
    Ok(Classification {
        message_id: row.get(0)?,
        industry: row.get(1)?,
        company_size_estimate: row.get(2)?,
        marketing_sophistication: row.get(3)?,
        sender_intent: row.get(4)?,
        product_type: row.get(5)?,
        product_description: row.get(6)?,
        pain_points: from_json_or_default(row.get(7)?),
        target_audience: row.get(8)?,
        partner_program_detected: row.get(9)?,
        renewal_signal_detected: row.get(10)?,
        ai_confidence: row.get(11)?,
        model_used: row.get(12)?,
        has_override: row.get(13)?,
    })
}

fn map_override(row: &Row<'_>) -> rusqlite::Result<ClassificationOverride> {
    let scope: String = row.get(6)?;
    Ok(ClassificationOverride {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sender_domain: row.get(2)?,
        field_name: row.get(3)?,
        original_value: row.get(4)?,
        corrected_value: row.get(5)?,
        override_scope: scope
            .parse::<OverrideScope>()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        created_at: row.get(7)?,
    })
}
