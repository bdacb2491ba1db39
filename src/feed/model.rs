//! Wire shapes of the feed API and their conversion into domain records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::model::{
    Category, Contact, Employer, FeedMetadata, ItemDetail, ItemSummary, Location, Occupation,
};

/// One page of the JSON Feed.
#[derive(Debug, Deserialize)]
pub struct FeedPageResp {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub home_page_url: Option<String>,
    pub feed_url: Option<String>,
    pub next_url: Option<String>,
    pub next_id: Option<String>,
    #[serde(default)]
    pub items: Vec<FeedItemResp>,
}

#[derive(Debug, Deserialize)]
pub struct FeedItemResp {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub date_modified: Option<String>,
    #[serde(rename = "_feed_entry")]
    pub feed_entry: Option<FeedEntryStub>,
}

#[derive(Debug, Deserialize)]
pub struct FeedEntryStub {
    pub uuid: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "sistEndret")]
    pub sist_endret: Option<String>,
}

/// Body of `/api/v1/feedentry/{id}`.
#[derive(Debug, Deserialize)]
pub struct FeedEntryResp {
    pub uuid: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "sistEndret")]
    pub sist_endret: Option<String>,
    pub ad_content: Option<AdContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdContent {
    pub link: Option<String>,
    pub title: Option<String>,
    pub employer: Option<EmployerField>,
    pub description: Option<String>,
    pub work_locations: Option<Vec<WorkLocation>>,
    pub extent: Option<String>,
    #[serde(rename = "engagementtype")]
    pub engagement_type: Option<String>,
    pub sector: Option<String>,
    pub application_due: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "sourceurl")]
    pub source_url: Option<String>,
    pub updated: Option<String>,
    pub published: Option<String>,
    pub expires: Option<String>,
    #[serde(rename = "starttime")]
    pub start_time: Option<String>,
    #[serde(rename = "positioncount")]
    pub position_count: Option<Value>,
    pub application_url: Option<String>,
    #[serde(rename = "jobtitle")]
    pub job_title: Option<String>,
    pub contact_list: Option<Vec<ContactResp>>,
    pub category_list: Option<Vec<CategoryResp>>,
    pub occupation_categories: Option<Vec<OccupationResp>>,
}

/// Upstream sends the employer either as an object or as a bare name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmployerField {
    Object(EmployerResp),
    Name(String),
}

#[derive(Debug, Deserialize)]
pub struct EmployerResp {
    pub name: Option<String>,
    pub orgnr: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkLocation {
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub county: Option<String>,
    pub municipal: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContactResp {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResp {
    pub category_type: Option<String>,
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OccupationResp {
    pub level1: Option<String>,
    pub level2: Option<String>,
}

/// Parse the timestamp flavours seen upstream: RFC 3339, naive ISO
/// date-times (taken as UTC), ISO dates and `dd.mm.yyyy`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

/// Extract the page id from a `next_url` such as `/api/v1/feed/<id>`.
pub fn page_id_from_url(url: &str) -> Option<String> {
    let (_, tail) = url.rsplit_once("/feed/")?;
    let id = tail.split(['?', '#', '/']).next().unwrap_or_default();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

impl FeedPageResp {
    pub fn metadata(&self, fetched_at: DateTime<Utc>) -> FeedMetadata {
        FeedMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            home_page_url: self.home_page_url.clone(),
            feed_url: self.feed_url.clone(),
            last_fetched_at: Some(fetched_at),
        }
    }

    pub fn next_page_id(&self) -> Option<String> {
        self.next_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.next_url.as_deref().and_then(page_id_from_url))
    }
}

impl From<FeedItemResp> for ItemSummary {
    fn from(item: FeedItemResp) -> Self {
        let status = item.feed_entry.as_ref().and_then(|e| e.status.clone());
        let date_modified = item
            .date_modified
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| {
                item.feed_entry
                    .as_ref()
                    .and_then(|e| e.sist_endret.as_deref())
                    .and_then(parse_timestamp)
            });
        ItemSummary {
            id: item.id,
            url: item.url,
            title: item.title,
            date_modified,
            status,
        }
    }
}

fn parse_opt(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(parse_timestamp)
}

fn position_count(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl FeedEntryResp {
    /// Convert into an [`ItemDetail`]. Returns `None` for entries without ad
    /// content. `requested_id` is used when the body carries no uuid.
    pub fn into_detail(self, requested_id: &str) -> Option<ItemDetail> {
        let ad = self.ad_content?;
        let id = self
            .uuid
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| requested_id.to_string());

        let employer = match ad.employer {
            Some(EmployerField::Object(e)) => Employer {
                name: e.name,
                orgnr: e.orgnr,
                description: e.description,
                homepage: e.homepage,
            },
            Some(EmployerField::Name(name)) => Employer {
                name: Some(name),
                ..Default::default()
            },
            None => Employer::default(),
        };

        let locations: Vec<Location> = ad
            .work_locations
            .unwrap_or_default()
            .into_iter()
            .map(|l| Location {
                address: l.address,
                city: l.city,
                postal_code: l.postal_code,
                county: l.county,
                municipal: l.municipal,
                country: l.country,
            })
            .collect();
        let (municipal, county) = locations
            .first()
            .map(|l| (l.municipal.clone(), l.county.clone()))
            .unwrap_or_default();

        let updated_at =
            parse_opt(self.sist_endret.as_deref()).or_else(|| parse_opt(ad.updated.as_deref()));

        Some(ItemDetail {
            id,
            status: self.status,
            title: ad.title,
            url: ad.link,
            employer,
            description_html: ad.description,
            municipal,
            county,
            extent: ad.extent,
            engagement_type: ad.engagement_type,
            sector: ad.sector,
            application_due_at: parse_opt(ad.application_due.as_deref()),
            application_due: ad.application_due,
            source: ad.source,
            source_url: ad.source_url,
            start_time: ad.start_time,
            position_count: position_count(ad.position_count.as_ref()),
            application_url: ad.application_url,
            job_title: ad.job_title,
            updated_at,
            published_at: parse_opt(ad.published.as_deref()),
            expires_at: parse_opt(ad.expires.as_deref()),
            locations,
            contacts: ad
                .contact_list
                .unwrap_or_default()
                .into_iter()
                .map(|c| Contact {
                    name: c.name,
                    email: c.email,
                    phone: c.phone,
                    role: c.role,
                    title: c.title,
                })
                .collect(),
            categories: ad
                .category_list
                .unwrap_or_default()
                .into_iter()
                .map(|c| Category {
                    category_type: c.category_type,
                    code: c.code,
                    name: c.name,
                })
                .collect(),
            occupations: ad
                .occupation_categories
                .unwrap_or_default()
                .into_iter()
                .map(|o| Occupation {
                    level1: o.level1,
                    level2: o.level2,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_timestamp_variants() {
        assert_eq!(
            parse_timestamp("2025-01-02T10:00:00+01:00").unwrap().to_rfc3339(),
            "2025-01-02T09:00:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2025-01-02T10:00:00.123456").unwrap().to_rfc3339(),
            "2025-01-02T10:00:00.123456+00:00"
        );
        assert_eq!(
            parse_timestamp("2025-01-02T10:00:00").unwrap().to_rfc3339(),
            "2025-01-02T10:00:00+00:00"
        );
        assert_eq!(
            parse_timestamp("30.01.2025").unwrap().to_rfc3339(),
            "2025-01-30T00:00:00+00:00"
        );
        assert!(parse_timestamp("Snarest").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn page_id_from_next_url() {
        assert_eq!(
            page_id_from_url("/api/v1/feed/abc-123").as_deref(),
            Some("abc-123")
        );
        assert_eq!(
            page_id_from_url("https://host/api/v1/feed/abc?x=1").as_deref(),
            Some("abc")
        );
        assert_eq!(page_id_from_url("/api/v1/feed/"), None);
        assert_eq!(page_id_from_url("/api/v1/other"), None);
    }

    #[test]
    fn decodes_page_and_summaries() {
        let body = json!({
            "version": "https://jsonfeed.org/version/1.1",
            "title": "Arbeidsplassen feed",
            "description": "Job ads",
            "home_page_url": "https://arbeidsplassen.nav.no",
            "feed_url": "https://pam-stilling-feed.nav.no/api/v1/feed",
            "id": "page-1",
            "next_url": "/api/v1/feed/page-2",
            "items": [
                {
                    "id": "e1",
                    "url": "/api/v1/feedentry/e1",
                    "title": "Developer",
                    "date_modified": "2025-01-02T08:00:00.5",
                    "_feed_entry": { "uuid": "u1", "status": "ACTIVE", "sistEndret": "2025-01-02T08:00:00" }
                },
                { "id": "e2", "_feed_entry": { "status": "INACTIVE", "sistEndret": "2024-05-01T00:00:00" } }
            ]
        });
        let page: FeedPageResp = serde_json::from_value(body).unwrap();
        assert_eq!(page.next_page_id().as_deref(), Some("page-2"));
        let meta = page.metadata(Utc::now());
        assert_eq!(meta.title.as_deref(), Some("Arbeidsplassen feed"));

        let items: Vec<ItemSummary> = page.items.into_iter().map(ItemSummary::from).collect();
        assert_eq!(items[0].id, "e1");
        assert_eq!(items[0].status.as_deref(), Some("ACTIVE"));
        assert!(items[0].date_modified.is_some());
        // falls back to sistEndret
        assert_eq!(
            items[1].date_modified.unwrap().to_rfc3339(),
            "2024-05-01T00:00:00+00:00"
        );
    }

    #[test]
    fn entry_converts_to_detail() {
        let body = json!({
            "uuid": "u1",
            "status": "ACTIVE",
            "sistEndret": "2025-01-03T12:00:00",
            "ad_content": {
                "uuid": "u1",
                "title": "Rust developer",
                "link": "https://arbeidsplassen.nav.no/stillinger/stilling/u1",
                "employer": { "name": "Acme AS", "orgnr": "123", "homepage": "https://acme.no" },
                "description": "<p>Write Rust</p>",
                "workLocations": [
                    { "address": "Gate 1", "city": "OSLO", "postalCode": "0150", "county": "OSLO", "municipal": "OSLO", "country": "NORGE" }
                ],
                "applicationDue": "Snarest",
                "positioncount": "2",
                "engagementtype": "Fast",
                "jobtitle": "Utvikler",
                "published": "2025-01-01T09:00:00",
                "contactList": [ { "name": "Kari", "email": "kari@acme.no" } ],
                "categoryList": [ { "categoryType": "STYRK08", "code": "2512", "name": "Programvareutviklere" } ],
                "occupationCategories": [ { "level1": "IT", "level2": "Utvikling" } ]
            }
        });
        let entry: FeedEntryResp = serde_json::from_value(body).unwrap();
        let detail = entry.into_detail("e1").unwrap();
        assert_eq!(detail.id, "u1");
        assert_eq!(detail.employer.name.as_deref(), Some("Acme AS"));
        assert_eq!(detail.municipal.as_deref(), Some("OSLO"));
        assert_eq!(detail.application_due.as_deref(), Some("Snarest"));
        assert!(detail.application_due_at.is_none());
        assert_eq!(detail.position_count, Some(2));
        assert_eq!(detail.engagement_type.as_deref(), Some("Fast"));
        assert_eq!(detail.contacts.len(), 1);
        assert_eq!(detail.categories[0].code.as_deref(), Some("2512"));
        assert_eq!(detail.occupations[0].level2.as_deref(), Some("Utvikling"));
        assert_eq!(
            detail.updated_at.unwrap().to_rfc3339(),
            "2025-01-03T12:00:00+00:00"
        );
    }

    #[test]
    fn employer_may_be_a_plain_name() {
        let entry: FeedEntryResp = serde_json::from_value(json!({
            "status": "ACTIVE",
            "ad_content": { "employer": "Acme AS", "contactList": null }
        }))
        .unwrap();
        let detail = entry.into_detail("fallback").unwrap();
        assert_eq!(detail.id, "fallback");
        assert_eq!(detail.employer.name.as_deref(), Some("Acme AS"));
        assert!(detail.contacts.is_empty());
    }

    #[test]
    fn entry_without_content_is_none() {
        let entry: FeedEntryResp =
            serde_json::from_value(json!({ "uuid": "u9", "status": "INACTIVE" })).unwrap();
        assert!(entry.into_detail("u9").is_none());
    }
}
