//! Profile-side repositories: sender profiles, relationships, gems,
//! segments, and engagement drafts.

use std::collections::{HashMap, HashSet};

use rusqlite::{OptionalExtension, Row, params};

use crate::models::{
    DraftStatus, EngagementDraft, Gem, GemStatus, GemType, Message, NewGem, RelationshipType,
    SenderProfile, SenderRelationship, SenderSegment, Strategy, Thread,
};
use crate::store::{Store, StoreError, from_json_or_default, parse_enum, to_json};

/// Filters for `list_gems`; unset fields do not constrain the query.
#[derive(Debug, Clone, Default)]
pub struct GemFilter {
    pub gem_type: Option<GemType>,
    pub status: Option<GemStatus>,
    pub segment: Option<String>,
    pub limit: Option<usize>,
}

impl Store {
    // ------------------------------------------------------------------
    // sender_profiles
    // ------------------------------------------------------------------

    pub fn upsert_profile(&self, profile: &SenderProfile) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sender_profiles (
                 sender_domain, company_name, primary_email, reply_to_email,
                 industry, company_size, marketing_sophistication_avg,
                 marketing_sophistication_trend, esp_used, product_type,
                 product_description, pain_points, target_audience,
                 known_contacts, total_messages, first_contact, last_contact,
                 avg_frequency_days, offer_type_distribution, cta_texts_all,
                 social_links, physical_address, utm_campaign_names,
                 has_personalization, has_partner_program, partner_program_urls,
                 renewal_dates, monetary_signals, authentication_quality,
                 unsubscribe_url, economic_segments, thread_initiation_ratio,
                 user_reply_rate
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                       ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33)",
            params![
                profile.sender_domain,
                profile.company_name,
                profile.primary_email,
                profile.reply_to_email,
                profile.industry,
                profile.company_size,
                profile.marketing_sophistication_avg,
                profile.marketing_sophistication_trend,
                profile.esp_used,
                profile.product_type,
                profile.product_description,
                to_json(&profile.pain_points)?,
                profile.target_audience,
                to_json(&profile.known_contacts)?,
                profile.total_messages,
                profile.first_contact,
                profile.last_contact,
                profile.avg_frequency_days,
                to_json(&profile.offer_type_distribution)?,
                to_json(&profile.cta_texts_all)?,
                to_json(&profile.social_links)?,
                profile.physical_address,
                to_json(&profile.utm_campaign_names)?,
                profile.has_personalization,
                profile.has_partner_program,
                to_json(&profile.partner_program_urls)?,
                to_json(&profile.renewal_dates)?,
                to_json(&profile.monetary_signals)?,
                profile.authentication_quality,
                profile.unsubscribe_url,
                to_json(&profile.economic_segments)?,
                profile.thread_initiation_ratio,
                profile.user_reply_rate,
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, domain: &str) -> Result<Option<SenderProfile>, StoreError> {
        self.conn()
            .query_row(
                &format!("{PROFILE_SELECT} WHERE sender_domain = ?1"),
                params![domain],
                map_profile,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_profiles(&self) -> Result<Vec<SenderProfile>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{PROFILE_SELECT} ORDER BY sender_domain"))?;
        let rows = stmt.query_map([], map_profile)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Profile count per industry, for industry-saturation detection and the
    /// by-industry stats view.
    pub fn industry_counts(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT industry, COUNT(*) FROM sender_profiles
             WHERE industry != '' GROUP BY industry",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(StoreError::from)
    }

    pub fn esp_counts(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT COALESCE(esp_used, 'unknown'), COUNT(*) FROM sender_profiles
             GROUP BY esp_used",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(StoreError::from)
    }

    /// Messages for a domain in chronological order, joined through the
    /// normalized sender domain.
    pub fn messages_for_domain(&self, domain: &str) -> Result<Vec<Message>, StoreError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT pm.message_id
                 FROM parsed_metadata pm
                 JOIN messages m ON pm.message_id = m.message_id
                 WHERE pm.sender_domain = ?1
                 ORDER BY m.date",
            )?;
            let rows = stmt.query_map(params![domain], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.get_message(&id)? {
                out.push(message);
            }
        }
        Ok(out)
    }

    pub fn threads_for_domain(&self, domain: &str) -> Result<Vec<Thread>, StoreError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT DISTINCT t.thread_id
                 FROM threads t
                 JOIN messages m ON t.thread_id = m.thread_id
                 JOIN parsed_metadata pm ON m.message_id = pm.message_id
                 WHERE pm.sender_domain = ?1",
            )?;
            let rows = stmt.query_map(params![domain], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(thread) = self.get_thread(&id)? {
                out.push(thread);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // sender_relationships
    // ------------------------------------------------------------------

    pub fn set_relationship(
        &self,
        domain: &str,
        relationship: RelationshipType,
        note: Option<&str>,
        suppress: bool,
        source: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sender_relationships (
                 sender_domain, relationship_type, relationship_note,
                 suppress_gems, source
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![domain, relationship.to_string(), note, suppress, source],
        )?;
        Ok(())
    }

    pub fn get_relationship(&self, domain: &str) -> Result<Option<SenderRelationship>, StoreError> {
        self.conn()
            .query_row(
                &format!("{RELATIONSHIP_SELECT} WHERE sender_domain = ?1"),
                params![domain],
                map_relationship,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_relationships(
        &self,
        type_filter: Option<RelationshipType>,
    ) -> Result<Vec<SenderRelationship>, StoreError> {
        match type_filter {
            Some(ty) => {
                let mut stmt = self.conn().prepare(&format!(
                    "{RELATIONSHIP_SELECT} WHERE relationship_type = ?1 ORDER BY sender_domain"
                ))?;
                let rows = stmt.query_map(params![ty.to_string()], map_relationship)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "{RELATIONSHIP_SELECT} ORDER BY relationship_type, sender_domain"
                ))?;
                let rows = stmt.query_map([], map_relationship)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
        }
    }

    pub fn relationship_map(&self) -> Result<HashMap<String, SenderRelationship>, StoreError> {
        let mut out = HashMap::new();
        for rel in self.list_relationships(None)? {
            out.insert(rel.sender_domain.clone(), rel);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // gems
    // ------------------------------------------------------------------

    /// Detection is re-entrant: old gems (and their drafts, to satisfy the
    /// foreign key) are cleared before re-detection.
    pub fn clear_gems(&self) -> Result<(), StoreError> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM engagement_drafts WHERE gem_id IN (SELECT id FROM gems)",
            [],
        )?;
        tx.execute("DELETE FROM gems", [])?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_gem(&self, gem: &NewGem) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO gems (
                 gem_type, sender_domain, thread_id, score, explanation,
                 recommended_actions, source_message_ids, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'new')",
            params![
                gem.gem_type.to_string(),
                gem.sender_domain,
                gem.thread_id,
                gem.score,
                to_json(&gem.explanation)?,
                to_json(&gem.recommended_actions)?,
                to_json(&gem.source_message_ids)?,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_gem(&self, id: i64) -> Result<Option<Gem>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("{GEM_SELECT} WHERE id = ?1"),
                params![id],
                map_gem_raw,
            )
            .optional()?;
        row.map(finish_gem).transpose()
    }

    pub fn list_gems(&self, filter: &GemFilter) -> Result<Vec<Gem>, StoreError> {
        let mut sql = format!("{GEM_SELECT} WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();
        if let Some(ty) = filter.gem_type {
            sql.push_str(" AND gem_type = ?");
            args.push(ty.to_string());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.to_string());
        }
        if let Some(segment) = &filter.segment {
            sql.push_str(
                " AND sender_domain IN (SELECT sender_domain FROM sender_segments WHERE segment = ?)",
            );
            args.push(segment.clone());
        }
        sql.push_str(" ORDER BY score DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), map_gem_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_gem(row?)?);
        }
        Ok(out)
    }

    pub fn gems_for_domain(&self, domain: &str) -> Result<Vec<Gem>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{GEM_SELECT} WHERE sender_domain = ?1"))?;
        let rows = stmt.query_map(params![domain], map_gem_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_gem(row?)?);
        }
        Ok(out)
    }

    pub fn gem_types_for_domain(&self, domain: &str) -> Result<HashSet<GemType>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT DISTINCT gem_type FROM gems WHERE sender_domain = ?1")?;
        let rows = stmt.query_map(params![domain], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(parse_enum::<GemType>("gem_type", row?)?);
        }
        Ok(out)
    }

    pub fn count_gems_by_type(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT gem_type, COUNT(*) FROM gems GROUP BY gem_type")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(StoreError::from)
    }

    pub fn update_gem_score(&self, id: i64, score: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("UPDATE gems SET score = ?1 WHERE id = ?2", params![score, id])?;
        Ok(())
    }

    pub fn update_gem_status(&self, id: i64, status: GemStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE gems SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // sender_segments
    // ------------------------------------------------------------------

    pub fn clear_segments(&self) -> Result<(), StoreError> {
        self.conn().execute("DELETE FROM sender_segments", [])?;
        Ok(())
    }

    pub fn upsert_segment(&self, segment: &SenderSegment) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sender_segments (
                 sender_domain, segment, sub_segment, confidence
             ) VALUES (?1, ?2, ?3, ?4)",
            params![
                segment.sender_domain,
                segment.segment,
                segment.sub_segment,
                segment.confidence,
            ],
        )?;
        Ok(())
    }

    pub fn segments_for_domain(&self, domain: &str) -> Result<Vec<SenderSegment>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT sender_domain, segment, sub_segment, confidence
             FROM sender_segments WHERE sender_domain = ?1",
        )?;
        let rows = stmt.query_map(params![domain], map_segment)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn list_segments(&self, segment: Option<&str>) -> Result<Vec<SenderSegment>, StoreError> {
        match segment {
            Some(name) => {
                let mut stmt = self.conn().prepare(
                    "SELECT sender_domain, segment, sub_segment, confidence
                     FROM sender_segments WHERE segment = ?1
                     ORDER BY sender_domain",
                )?;
                let rows = stmt.query_map(params![name], map_segment)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
            None => {
                let mut stmt = self.conn().prepare(
                    "SELECT sender_domain, segment, sub_segment, confidence
                     FROM sender_segments ORDER BY segment, sender_domain",
                )?;
                let rows = stmt.query_map([], map_segment)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
        }
    }

    // ------------------------------------------------------------------
    // engagement_drafts
    // ------------------------------------------------------------------

    pub fn insert_draft(
        &self,
        gem_id: i64,
        sender_domain: &str,
        strategy: Strategy,
        channel: &str,
        subject_line: &str,
        body_text: &str,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO engagement_drafts (
                 gem_id, sender_domain, strategy, channel, subject_line,
                 body_text, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft')",
            params![
                gem_id,
                sender_domain,
                strategy.to_string(),
                channel,
                subject_line,
                body_text,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Drafts generated on the current UTC day; the outreach cap counts these.
    pub fn drafts_generated_today(&self) -> Result<i64, StoreError> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM engagement_drafts
                 WHERE date(generated_at) = date('now')",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
    }

    pub fn list_drafts(&self) -> Result<Vec<EngagementDraft>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{DRAFT_SELECT} ORDER BY generated_at DESC, id DESC"))?;
        let rows = stmt.query_map([], map_draft)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

const PROFILE_SELECT: &str = "SELECT sender_domain, company_name, primary_email, reply_to_email, \
     industry, company_size, marketing_sophistication_avg, \
     marketing_sophistication_trend, esp_used, product_type, \
     product_description, pain_points, target_audience, known_contacts, \
     total_messages, first_contact, last_contact, avg_frequency_days, \
     offer_type_distribution, cta_texts_all, social_links, physical_address, \
     utm_campaign_names, has_personalization, has_partner_program, \
     partner_program_urls, renewal_dates, monetary_signals, \
     authentication_quality, unsubscribe_url, economic_segments, \
     thread_initiation_ratio, user_reply_rate FROM sender_profiles";

const RELATIONSHIP_SELECT: &str = "SELECT sender_domain, relationship_type, relationship_note, \
     suppress_gems, source, created_at FROM sender_relationships";

const GEM_SELECT: &str = "SELECT id, gem_type, sender_domain, thread_id, score, explanation, \
     recommended_actions, source_message_ids, status, created_at FROM gems";

const DRAFT_SELECT: &str = "SELECT id, gem_id, sender_domain, strategy, channel, subject_line, \
     body_text, body_html, status, generated_at, sent_at, response_received, \
     response_sentiment FROM engagement_drafts";

fn map_profile(row: &Row<'_>) -> rusqlite::Result<SenderProfile> {
    Ok(SenderProfile {
        sender_domain: row.get(0)?,
        company_name: row.get(1)?,
        primary_email: row.get(2)?,
        reply_to_email: row.get(3)?,
        industry: row.get(4)?,
        company_size: row.get(5)?,
        marketing_sophistication_avg: row.get(6)?,
        marketing_sophistication_trend: row.get(7)?,
        esp_used: row.get(8)?,
        product_type: row.get(9)?,
        product_description: row.get(10)?,
        pain_points: from_json_or_default(row.get(11)?),
        target_audience: row.get(12)?,
        known_contacts: from_json_or_default(row.get(13)?),
        total_messages: row.get(14)?,
        first_contact: row.get(15)?,
        last_contact: row.get(16)?,
        avg_frequency_days: row.get(17)?,
        offer_type_distribution: from_json_or_default(row.get(18)?),
        cta_texts_all: from_json_or_default(row.get(19)?),
        social_links: from_json_or_default(row.get(20)?),
        physical_address: row.get(21)?,
        utm_campaign_names: from_json_or_default(row.get(22)?),
        has_personalization: row.get(23)?,
        has_partner_program: row.get(24)?,
        partner_program_urls: from_json_or_default(row.get(25)?),
        renewal_dates: from_json_or_default(row.get(26)?),
        monetary_signals: from_json_or_default(row.get(27)?),
        authentication_quality: row.get(28)?,
        unsubscribe_url: row.get(29)?,
        economic_segments: from_json_or_default(row.get(30)?),
        thread_initiation_ratio: row.get(31)?,
        user_reply_rate: row.get(32)?,
    })
}

fn map_relationship(row: &Row<'_>) -> rusqlite::Result<SenderRelationship> {
    let ty: String = row.get(1)?;
    Ok(SenderRelationship {
        sender_domain: row.get(0)?,
        relationship_type: ty
            .parse::<RelationshipType>()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        relationship_note: row.get(2)?,
        suppress_gems: row.get(3)?,
        source: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct GemRaw {
    id: i64,
    gem_type: String,
    sender_domain: String,
    thread_id: Option<String>,
    score: i64,
    explanation: Option<String>,
    recommended_actions: Option<String>,
    source_message_ids: Option<String>,
    status: String,
    created_at: String,
}

fn map_gem_raw(row: &Row<'_>) -> rusqlite::Result<GemRaw> {
    Ok(GemRaw {
        id: row.get(0)?,
        gem_type: row.get(1)?,
        sender_domain: row.get(2)?,
        thread_id: row.get(3)?,
        score: row.get(4)?,
        explanation: row.get(5)?,
        recommended_actions: row.get(6)?,
        source_message_ids: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn finish_gem(raw: GemRaw) -> Result<Gem, StoreError> {
    let gem_type = parse_enum::<GemType>("gem_type", raw.gem_type)?;
    let explanation = raw
        .explanation
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_else(|| crate::models::GemExplanation {
            gem_type,
            summary: String::new(),
            signals: Vec::new(),
            confidence: 0.0,
            estimated_value: "low".to_string(),
            urgency: "low".to_string(),
        });
    Ok(Gem {
        id: raw.id,
        gem_type,
        sender_domain: raw.sender_domain,
        thread_id: raw.thread_id,
        score: raw.score,
        explanation,
        recommended_actions: from_json_or_default(raw.recommended_actions),
        source_message_ids: from_json_or_default(raw.source_message_ids),
        status: parse_enum::<GemStatus>("status", raw.status)?,
        created_at: raw.created_at,
    })
}

fn map_segment(row: &Row<'_>) -> rusqlite::Result<SenderSegment> {
    Ok(SenderSegment {
        sender_domain: row.get(0)?,
        segment: row.get(1)?,
        sub_segment: row.get(2)?,
        confidence: row.get(3)?,
    })
}

fn map_draft(row: &Row<'_>) -> rusqlite::Result<EngagementDraft> {
    let strategy: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(EngagementDraft {
        id: row.get(0)?,
        gem_id: row.get(1)?,
        sender_domain: row.get(2)?,
        strategy: strategy
            .parse::<Strategy>()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        channel: row.get(4)?,
        subject_line: row.get(5)?,
        body_text: row.get(6)?,
        body_html: row.get(7)?,
        status: status
            .parse::<DraftStatus>()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        generated_at: row.get(9)?,
        sent_at: row.get(10)?,
        response_received: row.get(11)?,
        response_sentiment: row.get(12)?,
    })
}
