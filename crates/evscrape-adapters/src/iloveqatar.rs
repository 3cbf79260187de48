use evscrape_core::{Event, EventFields, NO_DATE, NO_TITLE};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use serde_json::{Map, Value as JsonValue};

use crate::{
    absolute_url, all_elements, first_element, first_text, inner_text, selector, strip_label, text_or_none,
    AdapterError, FetchedPage, ListingPage, SourceAdapter,
};

static DATE_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)\s*(.*)$").expect("valid date range regex"));
static TIME_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)\s*-\s*(.+)$").expect("valid time range regex"));

const INFO_ITEM: &str = "div.events-page-info__item";

/// iloveqatar.net sports listings: a paged index of links to detail pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ILoveQatar;

impl SourceAdapter for ILoveQatar {
    fn source_id(&self) -> &'static str {
        "iloveqatar"
    }

    fn display_name(&self) -> &'static str {
        "I Love Qatar"
    }

    fn listing_url(&self, page: usize) -> String {
        format!("https://www.iloveqatar.net/events/sports/p{page}")
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(&page.body);
        let links = selector("a.article-block__title[href]")?;
        let detail_urls = document
            .select(&links)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| absolute_url(&page.final_url, href))
            .collect();
        Ok(ListingPage {
            events: Vec::new(),
            detail_urls,
            page_count: None,
        })
    }

    fn parse_detail(&self, page: &FetchedPage) -> Result<Option<Event>, AdapterError> {
        let document = Html::parse_document(&page.body);
        let root = document.root_element();

        let title = first_text(root, "h1")?.unwrap_or_else(|| NO_TITLE.to_string());
        let date_item = first_element(root, &format!("{INFO_ITEM}._date"))?;
        let time_item = first_element(root, &format!("{INFO_ITEM}._time"))?;
        let location_item = first_element(root, &format!("{INFO_ITEM}._location"))?;
        let ticket_items = all_elements(root, &format!("{INFO_ITEM}._tickets"))?;

        let labelled = |item: Option<ElementRef<'_>>, label: &str, fallback: &str| {
            item.and_then(|el| text_or_none(strip_label(&inner_text(el), label)))
                .unwrap_or_else(|| fallback.to_string())
        };
        let date = labelled(date_item, "Date:", NO_DATE);
        let time = labelled(time_item, "Time:", "No time");
        let location = labelled(location_item, "Location:", "No location");
        let tickets = labelled(ticket_items.first().copied(), "Tickets:", "No tickets");
        let prices = labelled(ticket_items.get(1).copied(), "Prices:", "No prices");

        let description = first_element(root, "div.article__content")?.and_then(|el| {
            let paragraphs = el
                .text()
                .filter_map(|t| text_or_none(t.to_string()))
                .collect::<Vec<_>>();
            text_or_none(paragraphs.join("\n"))
        });

        let parts = split_date_time(&date, &time);
        let snippet = |item: Option<ElementRef<'_>>| {
            item.map(|el| JsonValue::String(el.html()))
                .unwrap_or(JsonValue::Null)
        };
        let mut raw = Map::new();
        raw.insert("date".into(), snippet(date_item));
        raw.insert("time".into(), snippet(time_item));
        raw.insert("location".into(), snippet(location_item));

        let event = Event::new(EventFields {
            title: Some(title),
            start_date: Some(parts.start_date),
            end_date: Some(parts.end_date),
            time: Some(time),
            start_time: Some(parts.start_time),
            end_time: Some(parts.end_time),
            description,
            location: Some(location),
            link: Some(page.url.clone()),
            price: Some(prices),
            tickets: Some(tickets),
            source: Some(self.source_id().to_string()),
            raw_data: Some(raw),
            ..Default::default()
        })?;
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTimeParts {
    pub start_date: String,
    pub end_date: String,
    pub start_time: String,
    pub end_time: String,
}

/// Splits `"25 - 26 December 2023"` and `"6:00 PM - 10:00 PM"` style ranges.
/// Anything that is not a range is used for both ends.
pub fn split_date_time(date: &str, time: &str) -> DateTimeParts {
    let date = date.trim();
    let time = time.trim();

    let (start_date, end_date) = match DATE_RANGE_RE.captures(date) {
        Some(caps) => {
            let rest = caps[3].trim();
            (
                format!("{} {rest}", &caps[1]).trim().to_string(),
                format!("{} {rest}", &caps[2]).trim().to_string(),
            )
        }
        None => (date.to_string(), date.to_string()),
    };

    let (start_time, end_time) = match TIME_RANGE_RE.captures(time) {
        Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
        None => (time.to_string(), time.to_string()),
    };

    DateTimeParts {
        start_date,
        end_date,
        start_time,
        end_time,
    }
}
