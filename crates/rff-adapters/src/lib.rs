//! Listing-page extraction: cascading selectors, identity, filter, dedup.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use uuid::Uuid;

use rff_core::ListingRecord;

pub const CRATE_NAME: &str = "rff-adapters";

/// Ordered container queries, most to least specific. The first strategy
/// that yields at least one match wins; matches are never merged across
/// strategies. Loose `[class*=…]` forms keep extraction working across the
/// source site's periodic markup redesigns.
const SELECTOR_STRATEGIES: &[&str] = &[
    "div[class*='listing-card'], div[class*='listing-item'], div[class*='property-card'], article[class*='listing']",
    "div[class*='card']",
    "div[class*='listing']",
    "div[class*='property']",
    "div[class*='apt']",
    "div[class*='unit']",
    "a[class*='listing']",
    "a[href*='/listings/']",
];

/// `src` values containing any of these are lazy-load placeholders, not
/// real photos.
const PLACEHOLDER_MARKERS: &[&str] = &["placeholder", "place_holder", "loading"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{0}`")]
    Selector(String),
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Origin used to absolutize relative detail/image URLs.
    pub base_origin: String,
    /// Substring identifying the source site's image CDN; gallery scans
    /// keep only URLs containing it.
    pub gallery_cdn_marker: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            base_origin: "https://listings.example.com".to_string(),
            gallery_cdn_marker: "images.cdn.appfolio.com".to_string(),
        }
    }
}

/// Result of one extraction pass, with the diagnostics the sync engine
/// logs (which strategy matched, how many containers it saw).
#[derive(Debug, Clone)]
pub struct Extraction {
    pub records: Vec<ListingRecord>,
    pub selector_strategy: Option<&'static str>,
    pub card_count: usize,
}

struct CardSelectors {
    title: Selector,
    price_classed: Selector,
    detail_box_item: Selector,
    detail_box_label: Selector,
    detail_box_value: Selector,
    bed_classed: Selector,
    bath_classed: Selector,
    sqft_classed: Selector,
    address: Selector,
    availability: Selector,
    unit: Selector,
    img: Selector,
    anchor: Selector,
}

pub struct Extractor {
    config: ExtractorConfig,
    strategies: Vec<(&'static str, Selector)>,
    card: CardSelectors,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractError> {
        let strategies = SELECTOR_STRATEGIES
            .iter()
            .map(|s| Ok((*s, parse_selector(s)?)))
            .collect::<Result<Vec<_>, ExtractError>>()?;
        let card = CardSelectors {
            title: parse_selector("h2, h3, h4, a[class*='title'], div[class*='title']")?,
            price_classed: parse_selector("[class*='price']")?,
            detail_box_item: parse_selector("div[class*='detail-box__item']")?,
            detail_box_label: parse_selector("dt[class*='detail-box__label']")?,
            detail_box_value: parse_selector("dd[class*='detail-box__value']")?,
            bed_classed: parse_selector("[class*='bed']")?,
            bath_classed: parse_selector("[class*='bath']")?,
            sqft_classed: parse_selector("[class*='sqft'], [class*='sq-ft']")?,
            address: parse_selector("[class*='address'], address")?,
            availability: parse_selector("[class*='available'], [class*='availability']")?,
            unit: parse_selector("[class*='unit']")?,
            img: parse_selector("img")?,
            anchor: parse_selector("a[href]")?,
        };
        Ok(Self {
            config,
            strategies,
            card,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract listing records from an index page.
    ///
    /// Fields are extracted independently and tolerantly: a missing field
    /// is omitted, never aborts the record.
    pub fn extract(&self, html: &str) -> Extraction {
        let document = Html::parse_document(html);

        let mut matched: Option<(&'static str, Vec<ElementRef<'_>>)> = None;
        for (strategy, selector) in &self.strategies {
            let cards: Vec<ElementRef<'_>> = document.select(selector).collect();
            if !cards.is_empty() {
                matched = Some((*strategy, cards));
                break;
            }
        }

        let Some((strategy, cards)) = matched else {
            return Extraction {
                records: Vec::new(),
                selector_strategy: None,
                card_count: 0,
            };
        };

        let card_count = cards.len();
        let records = cards
            .into_iter()
            .map(|card| self.extract_card(card))
            .collect();

        Extraction {
            records,
            selector_strategy: Some(strategy),
            card_count,
        }
    }

    fn extract_card(&self, card: ElementRef<'_>) -> ListingRecord {
        let mut record = ListingRecord::default();

        record.title = select_first_text(card, &self.card.title);

        // Structured quick-facts box first; the loose class/text matches
        // below only fill what the box did not provide.
        for item in card.select(&self.card.detail_box_item) {
            let label = select_first_text(item, &self.card.detail_box_label);
            let value = select_first_text(item, &self.card.detail_box_value);
            let (Some(label), Some(value)) = (label, value) else {
                continue;
            };
            let label_lower = label.to_lowercase();
            if label_lower.contains("rent") {
                record.price = parse_price_token(&value).or(Some(0));
            } else if label_lower.contains("square feet") || label_lower.contains("sq ft") {
                record.sqft = first_number(&value);
            } else if label_lower.contains("bed") {
                record.bedrooms = number_before(&value, "bd").or_else(|| first_number(&value));
                if let Some(baths) = number_before(&value, "ba") {
                    record.bathrooms = Some(baths);
                }
            } else if label_lower.contains("bath") {
                record.bathrooms = first_number(&value);
            } else if label_lower.contains("available") {
                record.availability_text = Some(value);
            }
        }

        if record.price.is_none() {
            let price_text = select_first_text(card, &self.card.price_classed)
                .or_else(|| first_text_containing(card, "$"));
            // A price-shaped element with no $token reads as 0, not unset.
            record.price = price_text.map(|text| parse_price_token(&text).unwrap_or(0));
        }

        if record.bedrooms.is_none() {
            record.bedrooms = select_first_text(card, &self.card.bed_classed)
                .or_else(|| first_text_containing(card, "bed"))
                .and_then(|text| first_number(&text));
        }

        if record.bathrooms.is_none() {
            record.bathrooms = select_first_text(card, &self.card.bath_classed)
                .or_else(|| first_text_containing(card, "bath"))
                .and_then(|text| first_number(&text));
        }

        if record.sqft.is_none() {
            record.sqft = select_first_text(card, &self.card.sqft_classed)
                .or_else(|| first_text_containing(card, "sq"))
                .and_then(|text| first_number(&text));
        }

        record.address = select_first_text(card, &self.card.address);

        if record.availability_text.is_none() {
            record.availability_text = select_first_text(card, &self.card.availability);
        }

        record.image_url = card
            .select(&self.card.img)
            .next()
            .and_then(pick_image_attribute)
            .map(|url| self.normalize_url(&url));

        record.detail_url = card
            .select(&self.card.anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(non_empty)
            .map(|href| self.normalize_url(&href));

        record.unit_label = select_first_text(card, &self.card.unit)
            .or_else(|| first_text_containing(card, "Unit"));

        record
    }

    /// Collect full-size gallery URLs from a listing's detail page: every
    /// image URL on the configured CDN, deduplicated in page order, with
    /// the `/medium.` size token upgraded to `/large.`.
    pub fn extract_gallery(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for img in document.select(&self.card.img) {
            let Some(url) = pick_image_attribute(img) else {
                continue;
            };
            if !url.contains(&self.config.gallery_cdn_marker) {
                continue;
            }
            let url = url.replace("/medium.", "/large.");
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        urls
    }

    fn normalize_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let base = self.config.base_origin.trim_end_matches('/');
        if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }
}

/// Pick the real image URL off an `<img>`: lazy-load `data-src` first,
/// legacy `data-original` second, plain `src` last; the plain `src` is
/// used only when it is not a placeholder asset.
fn pick_image_attribute(img: ElementRef<'_>) -> Option<String> {
    let value = img.value();
    if let Some(src) = value.attr("data-src").and_then(non_empty) {
        return Some(src);
    }
    if let Some(src) = value.attr("data-original").and_then(non_empty) {
        return Some(src);
    }
    value
        .attr("src")
        .and_then(non_empty)
        .filter(|src| !is_placeholder_url(src))
}

fn is_placeholder_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|marker| lower.contains(marker))
}

// ---------------------------------------------------------------------------
// Identity

/// Derive the stable identity for a record: the UUID embedded in the
/// detail URL when present, else a v5 hash of `address|unit|price|beds`.
///
/// The fallback is intentionally coarse: two listings agreeing on those
/// four fields collide even if sqft differs. `None` only when there is no
/// detail-URL token and all four fallback fields are absent.
pub fn resolve_source_id(record: &ListingRecord) -> Option<String> {
    if let Some(url) = &record.detail_url {
        if let Some(token) = find_uuid_token(url) {
            return Some(token);
        }
    }

    let address = record.address.as_deref().unwrap_or("");
    let unit = record.unit_label.as_deref().unwrap_or("");
    let price = record.price.map(|p| p.to_string()).unwrap_or_default();
    let bedrooms = record.bedrooms.map(|b| b.to_string()).unwrap_or_default();
    if address.is_empty() && unit.is_empty() && price.is_empty() && bedrooms.is_empty() {
        return None;
    }

    let seed = format!("{address}|{unit}|{price}|{bedrooms}");
    Some(Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string())
}

/// Populate `source_id` on every record that resolves one.
pub fn resolve_identities(records: &mut [ListingRecord]) {
    for record in records {
        record.source_id = resolve_source_id(record);
    }
}

/// Scan for an 8-4-4-4-12 lowercase-hex token.
fn find_uuid_token(text: &str) -> Option<String> {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let bytes = text.as_bytes();
    let total = 36;
    if bytes.len() < total {
        return None;
    }
    'outer: for start in 0..=bytes.len() - total {
        let mut pos = start;
        for (i, group) in GROUPS.iter().enumerate() {
            for _ in 0..*group {
                let b = bytes[pos];
                if !(b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
                    continue 'outer;
                }
                pos += 1;
            }
            if i < GROUPS.len() - 1 {
                if bytes[pos] != b'-' {
                    continue 'outer;
                }
                pos += 1;
            }
        }
        return Some(text[start..start + total].to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// Filter

/// Case-insensitive substring match of the configured building filter
/// against address + title + unit label. An empty filter matches
/// everything. Exact substring only; operators keep the filter text in
/// sync with the source site's naming.
pub fn matches_building_filter(record: &ListingRecord, filter_text: &str) -> bool {
    if filter_text.is_empty() {
        return true;
    }
    let haystack = format!(
        "{} {} {}",
        record.address.as_deref().unwrap_or(""),
        record.title.as_deref().unwrap_or(""),
        record.unit_label.as_deref().unwrap_or(""),
    )
    .to_lowercase();
    haystack.contains(&filter_text.to_lowercase())
}

// ---------------------------------------------------------------------------
// Dedup

/// Collapse records sharing a `source_id`, keeping the first occurrence.
/// Records with no identity are kept; they cannot be matched across runs
/// and are handled create-only downstream.
pub fn dedupe(records: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    records
        .into_iter()
        .filter(|record| match &record.source_id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Shared text helpers

fn parse_selector(s: &str) -> Result<Selector, ExtractError> {
    Selector::parse(s).map_err(|_| ExtractError::Selector(s.to_string()))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|el| collapse_text(el.text().collect::<String>()))
}

/// First descendant whose direct text contains `needle`; returns its full
/// subtree text.
fn first_text_containing(scope: ElementRef<'_>, needle: &str) -> Option<String> {
    scope
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|el| own_text(*el).contains(needle))
        .and_then(|el| collapse_text(el.text().collect::<String>()))
}

fn own_text(el: ElementRef<'_>) -> String {
    el.children()
        .filter_map(|child| child.value().as_text().map(|t| &**t))
        .collect()
}

fn collapse_text(text: String) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// First `$<digits,with commas>` token, parsed with `$` and commas
/// stripped.
fn parse_price_token(text: &str) -> Option<i64> {
    let start = text.find('$')?;
    let digits: String = text[start + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// First numeric token after stripping thousands separators.
fn first_number(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in cleaned.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    if current.ends_with('.') {
        current.pop();
    }
    current.parse().ok()
}

/// Number immediately preceding a marker token, for combined values like
/// `3 bd / 1 ba`.
fn number_before(text: &str, marker: &str) -> Option<f64> {
    let lower = text.to_lowercase();
    let pos = lower.find(marker)?;
    let before = &lower[..pos];
    let end = before.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = before[..end]
        .rfind(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| i + 1)
        .unwrap_or(0);
    before[start..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(ExtractorConfig {
            base_origin: "https://cityblock.example.com".to_string(),
            ..Default::default()
        })
        .expect("extractor")
    }

    const DETAIL_BOX_CARD: &str = r#"
        <div class="listing-item result js-listing-item" id="listing_79">
          <div class="listing-item__body">
            <h2 class="listing-item__title"><a href="/listings/detail/5146bd15-a294-4045-9a9f-596c8de61bc5">Now Pre-Leasing 3 Bedroom Plans!</a></h2>
            <p><span class="js-listing-address">580 E Broad St, Athens, GA 30601</span></p>
            <div class="detail-box js-listing-quick-facts">
              <dl>
                <div class="detail-box__item">
                  <dt class="detail-box__label">RENT</dt>
                  <dd class="detail-box__value">$2,550</dd>
                </div>
                <div class="detail-box__item">
                  <dt class="detail-box__label">Square Feet</dt>
                  <dd class="detail-box__value">1,248</dd>
                </div>
                <div class="detail-box__item">
                  <dt class="detail-box__label">Bed / Bath</dt>
                  <dd class="detail-box__value">3 bd / 1 ba</dd>
                </div>
                <div class="detail-box__item">
                  <dt class="detail-box__label">Available</dt>
                  <dd class="detail-box__value js-listing-available">8/3/26</dd>
                </div>
              </dl>
            </div>
          </div>
        </div>"#;

    #[test]
    fn detail_box_fields_are_extracted() {
        let extraction = extractor().extract(DETAIL_BOX_CARD);
        // The loose class match also catches the nested __body container;
        // the outer card comes first in document order.
        assert_eq!(extraction.card_count, 2);
        let record = &extraction.records[0];
        assert_eq!(record.price, Some(2550));
        assert_eq!(record.sqft, Some(1248.0));
        assert_eq!(record.bedrooms, Some(3.0));
        assert_eq!(record.bathrooms, Some(1.0));
        assert_eq!(record.availability_text.as_deref(), Some("8/3/26"));
        assert_eq!(
            record.detail_url.as_deref(),
            Some("https://cityblock.example.com/listings/detail/5146bd15-a294-4045-9a9f-596c8de61bc5")
        );
    }

    #[test]
    fn first_matching_strategy_wins_without_merging() {
        // No listing-item/property containers: only the generic card
        // strategy matches, and both cards come from that one strategy.
        let html = r#"
            <div class="rental-card"><h3>Plan A</h3><span class="price">$900</span></div>
            <div class="rental-card"><h3>Plan B</h3><span class="price">$950</span></div>
            <div class="property-row"><h3>Ignored by later strategies</h3></div>
        "#;
        let extraction = extractor().extract(html);
        assert_eq!(
            extraction.selector_strategy,
            Some(SELECTOR_STRATEGIES[1]),
        );
        assert_eq!(extraction.card_count, 2);
        assert_eq!(extraction.records[0].title.as_deref(), Some("Plan A"));
        assert_eq!(extraction.records[1].price, Some(950));
    }

    #[test]
    fn zero_records_when_nothing_matches() {
        let extraction = extractor().extract("<html><body><p>maintenance page</p></body></html>");
        assert!(extraction.records.is_empty());
        assert!(extraction.selector_strategy.is_none());
    }

    #[test]
    fn placeholder_src_is_skipped_in_favor_of_data_original() {
        let html = r#"
            <div class="listing-item">
              <img src="https://listings.cdn.example.com/assets/place_holder-ea9e892a.png"
                   data-original="https://images.cdn.appfolio.com/cityblock/images/c5277ab4-2a8a-41d8-8dd2-9ecf390fdfc9/medium.jpg" />
            </div>"#;
        let extraction = extractor().extract(html);
        assert_eq!(
            extraction.records[0].image_url.as_deref(),
            Some("https://images.cdn.appfolio.com/cityblock/images/c5277ab4-2a8a-41d8-8dd2-9ecf390fdfc9/medium.jpg")
        );
    }

    #[test]
    fn placeholder_only_src_yields_no_image() {
        let html = r#"<div class="listing-item"><img src="/assets/loading-spinner.gif" /></div>"#;
        let extraction = extractor().extract(html);
        assert!(extraction.records[0].image_url.is_none());
    }

    #[test]
    fn data_src_outranks_data_original_and_src() {
        let html = r#"
            <div class="listing-item">
              <img data-src="https://cdn.example.com/real-1.jpg"
                   data-original="https://cdn.example.com/real-2.jpg"
                   src="https://cdn.example.com/real-3.jpg" />
            </div>"#;
        let extraction = extractor().extract(html);
        assert_eq!(
            extraction.records[0].image_url.as_deref(),
            Some("https://cdn.example.com/real-1.jpg")
        );
    }

    #[test]
    fn price_classed_element_without_token_reads_zero() {
        let html = r#"<div class="listing-item"><span class="price">Call for pricing</span></div>"#;
        let extraction = extractor().extract(html);
        assert_eq!(extraction.records[0].price, Some(0));
    }

    #[test]
    fn missing_price_element_stays_unset() {
        let html = r#"<div class="listing-item"><h3>Plan with no price</h3></div>"#;
        let extraction = extractor().extract(html);
        assert_eq!(extraction.records[0].price, None);
    }

    #[test]
    fn loose_bed_bath_text_fallback() {
        let html = r#"
            <div class="listing-item">
              <span class="beds">2 bedrooms</span>
              <span class="baths">1.5 bathrooms</span>
              <span class="sqft">1,100 sq ft</span>
            </div>"#;
        let extraction = extractor().extract(html);
        let record = &extraction.records[0];
        assert_eq!(record.bedrooms, Some(2.0));
        assert_eq!(record.bathrooms, Some(1.5));
        assert_eq!(record.sqft, Some(1100.0));
    }

    #[test]
    fn relative_urls_are_absolutized() {
        let html = r#"
            <div class="listing-item">
              <a href="/listings/detail/abc">View</a>
              <img data-original="/images/photo.jpg" />
            </div>"#;
        let extraction = extractor().extract(html);
        let record = &extraction.records[0];
        assert_eq!(
            record.detail_url.as_deref(),
            Some("https://cityblock.example.com/listings/detail/abc")
        );
        assert_eq!(
            record.image_url.as_deref(),
            Some("https://cityblock.example.com/images/photo.jpg")
        );
    }

    #[test]
    fn source_id_prefers_detail_url_uuid() {
        let record = ListingRecord {
            detail_url: Some(
                "https://cityblock.example.com/listings/detail/5146bd15-a294-4045-9a9f-596c8de61bc5"
                    .to_string(),
            ),
            address: Some("580 E Broad St".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_source_id(&record).as_deref(),
            Some("5146bd15-a294-4045-9a9f-596c8de61bc5")
        );
    }

    #[test]
    fn fallback_hash_is_stable_and_ignores_sqft() {
        let a = ListingRecord {
            address: Some("580 E Broad St".to_string()),
            unit_label: Some("Unit 4".to_string()),
            price: Some(2550),
            bedrooms: Some(3.0),
            sqft: Some(1248.0),
            ..Default::default()
        };
        let mut b = a.clone();
        b.sqft = Some(900.0);

        let id_a = resolve_source_id(&a).expect("id");
        let id_b = resolve_source_id(&b).expect("id");
        // Collision on sqft-only differences is the accepted scope of the
        // fallback hash.
        assert_eq!(id_a, id_b);

        let mut c = a.clone();
        c.price = Some(2600);
        assert_ne!(resolve_source_id(&c).expect("id"), id_a);
    }

    #[test]
    fn record_without_any_identity_fields_resolves_none() {
        let record = ListingRecord {
            title: Some("orphan".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_source_id(&record), None);
    }

    #[test]
    fn building_filter_is_case_insensitive_substring() {
        let record = ListingRecord {
            address: Some("580 E Broad St, Athens, GA 30601".to_string()),
            title: Some("Now Pre-Leasing!".to_string()),
            ..Default::default()
        };
        assert!(matches_building_filter(&record, "580 e broad st"));
        assert!(matches_building_filter(&record, ""));

        let other = ListingRecord {
            address: Some("123 Other St".to_string()),
            ..Default::default()
        };
        assert!(!matches_building_filter(&other, "580 E Broad St"));
    }

    #[test]
    fn dedupe_keeps_first_occurrence_and_identityless_records() {
        let mk = |id: Option<&str>, title: &str| ListingRecord {
            source_id: id.map(str::to_string),
            title: Some(title.to_string()),
            ..Default::default()
        };
        let records = vec![
            mk(Some("a"), "first a"),
            mk(None, "no identity"),
            mk(Some("b"), "first b"),
            mk(Some("a"), "second a"),
        ];
        let deduped = dedupe(records);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].title.as_deref(), Some("first a"));
        assert_eq!(deduped[1].title.as_deref(), Some("no identity"));
        assert_eq!(deduped[2].title.as_deref(), Some("first b"));
    }

    #[test]
    fn gallery_dedupes_and_upgrades_to_large() {
        let html = r#"
            <div class="gallery">
              <img data-original="https://images.cdn.appfolio.com/cityblock/images/aaa/medium.jpg" />
              <img data-original="https://images.cdn.appfolio.com/cityblock/images/aaa/large.jpg" />
              <img src="https://images.cdn.appfolio.com/cityblock/images/bbb/medium.png" />
              <img src="https://somewhere-else.example.com/not-cdn.jpg" />
            </div>"#;
        let urls = extractor().extract_gallery(html);
        assert_eq!(
            urls,
            vec![
                "https://images.cdn.appfolio.com/cityblock/images/aaa/large.jpg".to_string(),
                "https://images.cdn.appfolio.com/cityblock/images/bbb/large.png".to_string(),
            ]
        );
    }

    #[test]
    fn uuid_token_scan_rejects_near_misses() {
        assert_eq!(
            find_uuid_token("/listings/detail/ef687f9e-1fbb-45f4-b42c-417b02470800?tab=photos"),
            Some("ef687f9e-1fbb-45f4-b42c-417b02470800".to_string())
        );
        assert_eq!(find_uuid_token("/listings/detail/12345"), None);
        assert_eq!(
            find_uuid_token("ef687f9e-1fbb-45f4-b42c-417b0247080"), // 11-char tail
            None
        );
    }

    #[test]
    fn number_parsing_helpers() {
        assert_eq!(parse_price_token("RENT $2,550 / month"), Some(2550));
        assert_eq!(parse_price_token("no dollars here"), None);
        assert_eq!(first_number("1,248 sq ft"), Some(1248.0));
        assert_eq!(first_number("about 2.5 baths"), Some(2.5));
        assert_eq!(number_before("3 bd / 1 ba", "bd"), Some(3.0));
        assert_eq!(number_before("3 bd / 1.5 ba", "ba"), Some(1.5));
        assert_eq!(number_before("studio", "bd"), None);
    }
}
