use evscrape_core::{Event, EventFields, NO_TITLE};
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{
    absolute_url, first_element, json_str, json_string_vec, json_text, text_or_none, AdapterError, FetchedPage,
    ListingPage, SourceAdapter,
};

const CALENDAR_URL: &str = "https://visitqatar.com/intl-en/events-calendar/all-events";

/// Visit Qatar calendar: a single page embedding every event as JSON in the
/// `:events` attribute of its `vq-event-listing` component.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitQatar;

fn day_and_month(value: &JsonValue, key: &str) -> String {
    let day = json_text(value, &[key, "day"]).unwrap_or_else(|| "?".to_string());
    let month = json_text(value, &[key, "monthAndYear"]).unwrap_or_else(|| "?".to_string());
    format!("{day} {month}")
}

fn strip_paragraph_tags(text: &str) -> String {
    text.replace("<p>", "").replace("</p>", "").trim().to_string()
}

/// The attribute normally holds a JSON array; older markup held bare
/// comma-separated objects.
fn parse_embedded_events(raw: &str) -> Result<Vec<JsonValue>, AdapterError> {
    let raw = raw.trim();
    serde_json::from_str::<Vec<JsonValue>>(raw)
        .or_else(|_| serde_json::from_str::<Vec<JsonValue>>(&format!("[{raw}]")))
        .map_err(|e| AdapterError::Message(format!("invalid embedded events JSON: {e}")))
}

impl VisitQatar {
    fn event_from_json(&self, value: &JsonValue, base_url: &str) -> Result<Event, AdapterError> {
        let title = json_str(value, &["title"])
            .and_then(|t| text_or_none(t.to_string()))
            .unwrap_or_else(|| NO_TITLE.to_string());
        let summary = json_str(value, &["summary"]).and_then(|s| text_or_none(s.to_string()));
        let description = json_str(value, &["description"])
            .and_then(|d| text_or_none(strip_paragraph_tags(d)))
            .or(summary);

        let categories = json_string_vec(value, &["category"]);
        let category = if categories.is_empty() {
            "Uncategorized".to_string()
        } else {
            categories.join(", ")
        };

        let location = json_str(value, &["location"])
            .and_then(|l| text_or_none(l.to_string()))
            .unwrap_or_else(|| "Location not specified".to_string());
        let directions = json_str(value, &["linkToDirections", "path"]).unwrap_or("#").to_string();
        let free = value.get("free").and_then(JsonValue::as_bool).unwrap_or(false);
        let link = json_str(value, &["linkToDetailPage", "url"])
            .and_then(|url| absolute_url(base_url, url))
            .unwrap_or_else(|| "#".to_string());

        Ok(Event::new(EventFields {
            title: Some(title),
            start_date: Some(day_and_month(value, "startDate")),
            end_date: Some(day_and_month(value, "endDate")),
            description,
            location: Some(location),
            link: Some(link),
            directions: Some(directions),
            category: Some(category),
            price: Some(if free { "Free" } else { "Paid" }.to_string()),
            tags: categories,
            source: Some(self.source_id().to_string()),
            raw_data: value.as_object().cloned(),
            ..Default::default()
        })?)
    }
}

impl SourceAdapter for VisitQatar {
    fn source_id(&self) -> &'static str {
        "visitqatar"
    }

    fn display_name(&self) -> &'static str {
        "Visit Qatar"
    }

    fn listing_url(&self, _page: usize) -> String {
        CALENDAR_URL.to_string()
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(&page.body);
        let listing = first_element(document.root_element(), "vq-event-listing")?
            .ok_or_else(|| AdapterError::Message("vq-event-listing element not found".into()))?;
        let raw = listing
            .value()
            .attr(":events")
            .ok_or_else(|| AdapterError::Message("vq-event-listing has no :events attribute".into()))?;

        let mut events = Vec::new();
        for value in parse_embedded_events(raw)? {
            match self.event_from_json(&value, &page.final_url) {
                Ok(event) => events.push(event),
                Err(err) => warn!(source_id = self.source_id(), error = %err, "skipping embedded event"),
            }
        }

        Ok(ListingPage {
            events,
            detail_urls: Vec::new(),
            page_count: Some(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_event_defaults_match_calendar_conventions() {
        let value = json!({
            "title": "Qatar Balloon Festival",
            "description": "<p>Hot air balloons over Doha.</p>",
            "startDate": {"day": 12, "monthAndYear": "Dec 2024"},
            "endDate": {"day": "21", "monthAndYear": "Dec 2024"},
            "free": true
        });
        let event = VisitQatar.event_from_json(&value, CALENDAR_URL).unwrap();
        assert_eq!(event.start_date(), "12 Dec 2024");
        assert_eq!(event.end_date(), "21 Dec 2024");
        assert_eq!(event.description(), Some("Hot air balloons over Doha."));
        assert_eq!(event.category(), Some("Uncategorized"));
        assert_eq!(event.location(), Some("Location not specified"));
        assert_eq!(event.directions(), Some("#"));
        assert_eq!(event.link(), Some("#"));
        assert_eq!(event.price(), Some("Free"));
        assert!(event.raw_data().is_some());
    }

    #[test]
    fn bare_object_sequences_are_accepted() {
        let parsed = parse_embedded_events(r#"{"title":"a"},{"title":"b"}"#).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn missing_component_is_a_listing_error() {
        let page = FetchedPage::from_text(CALENDAR_URL, "<html><body><p>maintenance</p></body></html>");
        assert!(VisitQatar.parse_listing(&page).is_err());
    }
}
