use evscrape_core::{Event, EventFields, NO_DATE, NO_TITLE};
use scraper::{ElementRef, Html};
use tracing::warn;

use crate::{
    absolute_url, all_elements, first_attr, first_text, inner_text, AdapterError, FetchedPage, ListingPage,
    SourceAdapter,
};

/// Qatar Museums calendar: every event is a card on the paged listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct QatarMuseums;

impl QatarMuseums {
    fn parse_card(&self, card: ElementRef<'_>, base_url: &str) -> Result<Event, AdapterError> {
        let link = card
            .value()
            .attr("href")
            .and_then(|href| absolute_url(base_url, href));
        let title = first_text(card, "p.card__title")?.unwrap_or_else(|| NO_TITLE.to_string());
        let category = first_text(card, "p.card__pre-title")?.unwrap_or_else(|| "No category".to_string());
        // Dates are free text ("Until 30 June 2024", "Ongoing") and kept unparsed.
        let date_text = first_text(card, "div.richtext--simple p")?.unwrap_or_else(|| NO_DATE.to_string());
        let location = first_text(card, "span.museum-tag__span")?.unwrap_or_else(|| "No location".to_string());
        let image_url = first_attr(card, "img.picture__image", "src")?
            .map(|src| absolute_url(base_url, &src).unwrap_or(src));

        Ok(Event::new(EventFields {
            title: Some(title),
            start_date: Some(date_text.clone()),
            end_date: Some(date_text),
            location: Some(location),
            link,
            image_url,
            category: Some(category),
            source: Some(self.source_id().to_string()),
            ..Default::default()
        })?)
    }
}

impl SourceAdapter for QatarMuseums {
    fn source_id(&self) -> &'static str {
        "qmuseums"
    }

    fn display_name(&self) -> &'static str {
        "Qatar Museums"
    }

    fn listing_url(&self, page: usize) -> String {
        format!("https://qm.org.qa/en/calendar/?page={page}")
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(&page.body);
        let root = document.root_element();

        let page_count = all_elements(root, ".number-button__span")?
            .into_iter()
            .filter_map(|el| inner_text(el).parse::<usize>().ok())
            .max()
            .unwrap_or(1);

        let mut events = Vec::new();
        for card in all_elements(root, "a.card--landscape")? {
            match self.parse_card(card, &page.final_url) {
                Ok(event) => events.push(event),
                Err(err) => warn!(source_id = self.source_id(), error = %err, "skipping calendar card"),
            }
        }

        Ok(ListingPage {
            events,
            detail_urls: Vec::new(),
            page_count: Some(page_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_without_pagination_is_a_single_page() {
        let page = FetchedPage::from_text(
            "https://qm.org.qa/en/calendar/?page=1",
            r#"<a class="card--landscape" href="/en/calendar/x/"><p class="card__title">  Tea   Talk </p></a>"#,
        );
        let listing = QatarMuseums.parse_listing(&page).unwrap();
        assert_eq!(listing.page_count, Some(1));
        assert_eq!(listing.events.len(), 1);
        let event = &listing.events[0];
        assert_eq!(event.title(), "Tea Talk");
        assert_eq!(event.start_date(), NO_DATE);
        assert_eq!(event.category(), Some("No category"));
        assert_eq!(event.link(), Some("https://qm.org.qa/en/calendar/x/"));
    }
}
