//! Structured markup readers: schema.org (JSON-LD and microdata) and OpenGraph.

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;

use graphloom_shared::{EntityType, ExtractionMethod, PipelineError, Result};

use crate::draft::{DraftKey, EntityDraft, StrategyOutput};

/// Nesting limit for JSON-LD objects.
const MAX_DEPTH: usize = 6;

/// Longest scalar copied into entity properties.
const MAX_PROPERTY_LEN: usize = 500;

/// schema.org properties that link two things, with the type assumed for a
/// bare string value.
const RELATIONS: &[(&str, EntityType)] = &[
    ("author", EntityType::Person),
    ("creator", EntityType::Person),
    ("founder", EntityType::Person),
    ("employee", EntityType::Person),
    ("member", EntityType::Person),
    ("performer", EntityType::Person),
    ("actor", EntityType::Person),
    ("director", EntityType::Person),
    ("editor", EntityType::Person),
    ("contributor", EntityType::Person),
    ("publisher", EntityType::Organization),
    ("worksFor", EntityType::Organization),
    ("memberOf", EntityType::Organization),
    ("affiliation", EntityType::Organization),
    ("brand", EntityType::Organization),
    ("manufacturer", EntityType::Organization),
    ("parentOrganization", EntityType::Organization),
    ("subOrganization", EntityType::Organization),
    ("alumniOf", EntityType::Organization),
    ("organizer", EntityType::Organization),
    ("sponsor", EntityType::Organization),
    ("provider", EntityType::Organization),
    ("location", EntityType::Location),
    ("birthPlace", EntityType::Location),
    ("homeLocation", EntityType::Location),
    ("workLocation", EntityType::Location),
    ("foundingLocation", EntityType::Location),
    ("containedInPlace", EntityType::Location),
    ("areaServed", EntityType::Location),
    ("about", EntityType::Concept),
    ("mentions", EntityType::Concept),
    ("isPartOf", EntityType::Document),
];

// ---------------------------------------------------------------------------
// schema.org
// ---------------------------------------------------------------------------

/// Read JSON-LD blocks and microdata items.
///
/// Malformed JSON-LD blocks are skipped; the strategy fails only when every
/// block is malformed and nothing else was found.
pub fn schema_org(doc: &Html, confidence: f64) -> Result<StrategyOutput> {
    let mut values = Vec::new();
    let mut last_error = None;
    if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
        for script in doc.select(&sel) {
            let body = script.text().collect::<String>();
            if body.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(body.trim()) {
                Ok(value) => values.push(value),
                Err(e) => {
                    debug!(error = %e, "skipping malformed JSON-LD block");
                    last_error = Some(e);
                }
            }
        }
    }

    let mut reader = JsonLdReader::new(confidence);
    reader.read(&values);
    let mut output = reader.out;
    read_microdata(doc, confidence, &mut output);

    match last_error {
        Some(e) if values.is_empty() && output.is_empty() => Err(PipelineError::Extraction(
            format!("invalid JSON-LD: {e}"),
        )),
        _ => Ok(output),
    }
}

struct JsonLdReader<'v> {
    out: StrategyOutput,
    confidence: f64,
    nodes_by_id: HashMap<&'v str, &'v Map<String, Value>>,
    /// `@id` -> key once a node has been emitted; `None` while in progress.
    emitted: HashMap<&'v str, Option<DraftKey>>,
}

impl<'v> JsonLdReader<'v> {
    fn new(confidence: f64) -> Self {
        Self {
            out: StrategyOutput::default(),
            confidence,
            nodes_by_id: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    fn read(&mut self, values: &'v [Value]) {
        let roots: Vec<&'v Map<String, Value>> = values.iter().flat_map(roots_of).collect();
        for root in &roots {
            if let Some(id) = root.get("@id").and_then(Value::as_str) {
                self.nodes_by_id.entry(id).or_insert(*root);
            }
        }
        for root in roots {
            self.node(root, 0);
        }
    }

    /// Emit the entity for `obj` (and everything nested in it).
    fn node(&mut self, obj: &'v Map<String, Value>, depth: usize) -> Option<DraftKey> {
        if depth > MAX_DEPTH {
            return None;
        }

        let id = obj.get("@id").and_then(Value::as_str);
        if let Some(id) = id {
            if let Some(done) = self.emitted.get(id) {
                return done.clone();
            }
            // A bare reference: resolve it against the graph.
            if obj.len() == 1 {
                let target = self.nodes_by_id.get(id).copied()?;
                return self.node(target, depth + 1);
            }
            self.emitted.insert(id, None);
        }

        let key = self.entity(obj);

        for (prop, fallback_type) in RELATIONS {
            let Some(value) = obj.get(*prop) else { continue };
            for item in as_items(value) {
                let child = match item {
                    Value::Object(nested) => self.node(nested, depth + 1),
                    Value::String(s) if !looks_like_url(s) => self.out.push_entity(EntityDraft::new(
                        s.as_str(),
                        *fallback_type,
                        ExtractionMethod::SchemaOrg,
                        self.confidence,
                    )),
                    _ => None,
                };
                if let (Some(source), Some(target)) = (&key, &child) {
                    self.out
                        .relate(source, target, relation_name(prop), self.confidence);
                }
            }
        }

        if let Some(id) = id {
            self.emitted.insert(id, key.clone());
        }
        key
    }

    fn entity(&mut self, obj: &Map<String, Value>) -> Option<DraftKey> {
        let schema_type = schema_type(obj)?;
        let name = ["name", "headline", "legalName", "alternateName"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .filter(|n| !n.trim().is_empty())?;

        let mut draft = EntityDraft::new(
            name,
            entity_type_for_schema(schema_type),
            ExtractionMethod::SchemaOrg,
            self.confidence,
        )
        .with_description(
            obj.get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
        )
        .with_property("schema_type", schema_type);

        if let Some(id) = obj.get("@id").and_then(Value::as_str) {
            draft = draft.with_property("schema_id", id);
        }
        for (key, value) in obj {
            if key.starts_with('@')
                || matches!(key.as_str(), "name" | "description")
                || RELATIONS.iter().any(|(r, _)| *r == key.as_str())
            {
                continue;
            }
            if let Some(scalar) = scalar_property(value) {
                draft.properties.insert(key.clone(), scalar);
            }
        }

        self.out.push_entity(draft)
    }
}

/// Top-level objects of a JSON-LD document: arrays, `@graph`, or a lone node.
fn roots_of(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Array(items) => items.iter().flat_map(roots_of).collect(),
        Value::Object(obj) => match obj.get("@graph") {
            Some(graph) => {
                let mut roots = roots_of(graph);
                if obj.contains_key("@type") {
                    roots.push(obj);
                }
                roots
            }
            None => vec![obj],
        },
        _ => Vec::new(),
    }
}

fn as_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn schema_type(obj: &Map<String, Value>) -> Option<&str> {
    let raw = match obj.get("@type")? {
        Value::String(s) => s.as_str(),
        Value::Array(types) => types.iter().find_map(Value::as_str)?,
        _ => return None,
    };
    // Full IRIs like "https://schema.org/Person".
    Some(raw.rsplit('/').next().unwrap_or(raw))
}

fn scalar_property(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if !s.is_empty() && s.len() <= MAX_PROPERTY_LEN => Some(value.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.clone()),
        Value::Array(items) => {
            let strings: Vec<Value> = items
                .iter()
                .filter(|v| v.as_str().is_some_and(|s| s.len() <= MAX_PROPERTY_LEN))
                .cloned()
                .collect();
            (!strings.is_empty() && strings.len() == items.len()).then_some(Value::Array(strings))
        }
        _ => None,
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with('#')
}

/// Map a schema.org type name onto an entity type.
pub fn entity_type_for_schema(schema_type: &str) -> EntityType {
    match schema_type {
        "Person" | "Patient" => EntityType::Person,
        "Organization" | "Corporation" | "LocalBusiness" | "NGO" | "Airline" | "SportsTeam"
        | "Brand" => EntityType::Organization,
        "Place" | "City" | "Country" | "State" | "AdministrativeArea" | "Landform"
        | "LandmarksOrHistoricalBuildings" | "TouristAttraction" => EntityType::Location,
        "Product" | "SoftwareApplication" | "WebApplication" | "MobileApplication" | "Vehicle"
        | "IndividualProduct" | "ProductModel" => EntityType::Product,
        "CreativeWork" | "Article" | "NewsArticle" | "BlogPosting" | "TechArticle"
        | "ScholarlyArticle" | "Report" | "Book" | "WebPage" | "WebSite" | "Dataset" | "Movie"
        | "Recipe" | "Review" | "Course" | "HowTo" => EntityType::Document,
        "DefinedTerm" | "Thing" | "Intangible" | "Occupation" => EntityType::Concept,
        t if t.ends_with("Event") => EntityType::Event,
        t if t.ends_with("Organization") || t.ends_with("Business") || t.ends_with("Store") => {
            EntityType::Organization
        }
        t if t.ends_with("Place") => EntityType::Location,
        t if t.ends_with("Article") || t.ends_with("Page") => EntityType::Document,
        _ => EntityType::Custom,
    }
}

/// `worksFor` -> `works_for`.
fn relation_name(prop: &str) -> String {
    let mut out = String::with_capacity(prop.len() + 4);
    for c in prop.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Microdata
// ---------------------------------------------------------------------------

fn read_microdata(doc: &Html, confidence: f64, out: &mut StrategyOutput) {
    let (Ok(scope_sel), Ok(prop_sel)) = (
        Selector::parse("[itemscope][itemtype]"),
        Selector::parse("[itemprop]"),
    ) else {
        return;
    };

    let mut keys = HashMap::new();
    let scopes: Vec<ElementRef<'_>> = doc.select(&scope_sel).collect();

    for scope in &scopes {
        let Some(itemtype) = scope.value().attr("itemtype") else { continue };
        let schema_type = itemtype
            .split_whitespace()
            .next()
            .and_then(|t| t.rsplit('/').next())
            .unwrap_or_default();
        if schema_type.is_empty() {
            continue;
        }

        let mut name = None;
        let mut description = None;
        for prop in scope.select(&prop_sel) {
            if nearest_scope(&prop).map(|s| s.id()) != Some(scope.id()) {
                continue;
            }
            let props = prop.value().attr("itemprop").unwrap_or_default();
            for token in props.split_whitespace() {
                match token {
                    "name" if name.is_none() => name = Some(prop_value(&prop)),
                    "description" if description.is_none() => {
                        description = Some(prop_value(&prop))
                    }
                    _ => {}
                }
            }
        }

        let Some(name) = name.filter(|n| !n.is_empty()) else { continue };
        let draft = EntityDraft::new(
            name,
            entity_type_for_schema(schema_type),
            ExtractionMethod::SchemaOrg,
            confidence,
        )
        .with_description(description)
        .with_property("schema_type", schema_type);
        if let Some(key) = out.push_entity(draft) {
            keys.insert(scope.id(), key);
        }
    }

    // A nested item carrying `itemprop` is a property of its parent item.
    for scope in &scopes {
        let Some(prop) = scope.value().attr("itemprop") else { continue };
        let Some(child) = keys.get(&scope.id()) else { continue };
        let Some(parent) = nearest_scope(scope).and_then(|s| keys.get(&s.id())) else {
            continue;
        };
        for token in prop.split_whitespace() {
            out.relate(parent, child, relation_name(token), confidence);
        }
    }
}

/// The closest strict ancestor carrying `itemscope`.
fn nearest_scope<'a>(el: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().attr("itemscope").is_some())
}

fn prop_value(el: &ElementRef<'_>) -> String {
    match el.value().attr("content") {
        Some(content) => content.trim().to_string(),
        None => el
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
    }
}

// ---------------------------------------------------------------------------
// OpenGraph
// ---------------------------------------------------------------------------

/// Read `og:*` meta tags: the page's subject and its publishing site.
pub fn open_graph(doc: &Html, confidence: f64) -> StrategyOutput {
    let mut out = StrategyOutput::default();
    let Ok(sel) = Selector::parse("meta[property], meta[name]") else {
        return out;
    };

    let mut tags: HashMap<String, String> = HashMap::new();
    for meta in doc.select(&sel) {
        let el = meta.value();
        let Some(prop) = el.attr("property").or_else(|| el.attr("name")) else {
            continue;
        };
        let prop = prop.trim().to_ascii_lowercase();
        if !(prop.starts_with("og:") || prop.starts_with("profile:")) {
            continue;
        }
        if let Some(content) = el.attr("content").map(str::trim).filter(|c| !c.is_empty()) {
            tags.entry(prop).or_insert_with(|| content.to_string());
        }
    }
    if tags.is_empty() {
        return out;
    }

    let og_type = tags.get("og:type").map(String::as_str).unwrap_or("website");
    let title = tags.get("og:title").cloned().or_else(|| {
        let first = tags.get("profile:first_name")?;
        Some(match tags.get("profile:last_name") {
            Some(last) => format!("{first} {last}"),
            None => first.clone(),
        })
    });

    let subject = title.and_then(|title| {
        let mut draft = EntityDraft::new(
            title,
            entity_type_for_og(og_type),
            ExtractionMethod::OpenGraph,
            confidence,
        )
        .with_description(tags.get("og:description").cloned())
        .with_property("og_type", og_type);
        for (tag, key) in [("og:url", "url"), ("og:image", "image"), ("og:locale", "locale")] {
            if let Some(value) = tags.get(tag) {
                draft = draft.with_property(key, value.as_str());
            }
        }
        out.push_entity(draft)
    });

    let site = tags.get("og:site_name").and_then(|site| {
        out.push_entity(EntityDraft::new(
            site.as_str(),
            EntityType::Organization,
            ExtractionMethod::OpenGraph,
            confidence,
        ))
    });

    if let (Some(subject), Some(site)) = (&subject, &site) {
        out.relate(subject, site, "published_by", confidence);
    }
    out
}

fn entity_type_for_og(og_type: &str) -> EntityType {
    match og_type {
        "profile" => EntityType::Person,
        "product" | "product.item" | "product.group" => EntityType::Product,
        "event" => EntityType::Event,
        "place" => EntityType::Location,
        "business.business" | "restaurant.restaurant" => EntityType::Organization,
        _ => EntityType::Document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(html: &str) -> Html {
        Html::parse_document(html)
    }

    fn find<'a>(out: &'a StrategyOutput, name: &str) -> &'a EntityDraft {
        out.entities
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("no entity named {name}"))
    }

    #[test]
    fn json_ld_article_with_nested_author_and_publisher() {
        let html = r#"<html><head><script type="application/ld+json">
        {
          "@context": "https://schema.org",
          "@type": "NewsArticle",
          "headline": "Anvils Reconsidered",
          "datePublished": "2024-03-01",
          "author": {
            "@type": "Person",
            "name": "Jane Doe",
            "worksFor": {"@type": "Organization", "name": "Acme Corp"}
          },
          "publisher": "Daily Planet"
        }
        </script></head><body></body></html>"#;

        let out = schema_org(&doc(html), 0.95).unwrap();
        assert_eq!(find(&out, "Anvils Reconsidered").entity_type, EntityType::Document);
        assert_eq!(find(&out, "Jane Doe").entity_type, EntityType::Person);
        assert_eq!(find(&out, "Acme Corp").entity_type, EntityType::Organization);
        assert_eq!(find(&out, "Daily Planet").entity_type, EntityType::Organization);
        assert_eq!(
            find(&out, "Anvils Reconsidered").properties.get("datePublished"),
            Some(&Value::from("2024-03-01"))
        );

        let kinds: Vec<&str> = out
            .relationships
            .iter()
            .map(|r| r.relationship_type.as_str())
            .collect();
        assert!(kinds.contains(&"author"));
        assert!(kinds.contains(&"works_for"));
        assert!(kinds.contains(&"publisher"));
    }

    #[test]
    fn json_ld_graph_resolves_id_references() {
        let html = r##"<script type="application/ld+json">
        {"@context": "https://schema.org", "@graph": [
          {"@type": "Organization", "@id": "#org", "name": "Acme Corp"},
          {"@type": "Person", "@id": "#jane", "name": "Jane Doe", "worksFor": {"@id": "#org"}},
          {"@type": "Event", "name": "AnvilCon 2024", "location": {"@type": "City", "name": "Springfield"},
           "organizer": {"@id": "#org"}}
        ]}
        </script>"##;

        let out = schema_org(&doc(html), 0.95).unwrap();
        assert_eq!(
            out.entities.iter().filter(|e| e.name == "Acme Corp").count(),
            1
        );
        assert_eq!(find(&out, "AnvilCon 2024").entity_type, EntityType::Event);
        assert_eq!(find(&out, "Springfield").entity_type, EntityType::Location);
        assert_eq!(out.relationships.len(), 3);
        assert!(
            out.relationships
                .iter()
                .any(|r| r.relationship_type == "works_for"
                    && r.target.normalized_name == "acme corp")
        );
    }

    #[test]
    fn malformed_json_ld_alone_is_an_error() {
        let html = r#"<script type="application/ld+json">{ not json </script>"#;
        assert!(schema_org(&doc(html), 0.95).is_err());
    }

    #[test]
    fn malformed_block_next_to_good_one_is_skipped() {
        let html = r#"
            <script type="application/ld+json">{ broken</script>
            <script type="application/ld+json">{"@type": "Person", "name": "Ada"}</script>"#;
        let out = schema_org(&doc(html), 0.95).unwrap();
        assert_eq!(out.entities.len(), 1);
    }

    #[test]
    fn microdata_items_and_nested_properties() {
        let html = r#"<body>
          <div itemscope itemtype="https://schema.org/Person">
            <span itemprop="name">Grace Hopper</span>
            <div itemprop="worksFor" itemscope itemtype="https://schema.org/Organization">
              <span itemprop="name">US Navy</span>
            </div>
          </div>
        </body>"#;
        let out = schema_org(&doc(html), 0.95).unwrap();
        assert_eq!(find(&out, "Grace Hopper").entity_type, EntityType::Person);
        assert_eq!(find(&out, "US Navy").entity_type, EntityType::Organization);
        assert_eq!(out.relationships.len(), 1);
        assert_eq!(out.relationships[0].relationship_type, "works_for");
        assert_eq!(out.relationships[0].source.normalized_name, "grace hopper");
    }

    #[test]
    fn page_without_markup_is_empty_not_an_error() {
        let out = schema_org(&doc("<p>plain</p>"), 0.95).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn open_graph_subject_and_site() {
        let html = r#"<head>
          <meta property="og:title" content="Anvils Reconsidered">
          <meta property="og:type" content="article">
          <meta property="og:site_name" content="Daily Planet">
          <meta property="og:description" content="A long look at anvils.">
          <meta property="og:url" content="https://planet.example/anvils">
        </head>"#;
        let out = open_graph(&doc(html), 0.95);
        let article = find(&out, "Anvils Reconsidered");
        assert_eq!(article.entity_type, EntityType::Document);
        assert_eq!(article.description.as_deref(), Some("A long look at anvils."));
        assert_eq!(find(&out, "Daily Planet").entity_type, EntityType::Organization);
        assert_eq!(out.relationships[0].relationship_type, "published_by");
    }

    #[test]
    fn open_graph_profile_names_a_person() {
        let html = r#"<head>
          <meta property="og:type" content="profile">
          <meta property="profile:first_name" content="Jane">
          <meta property="profile:last_name" content="Doe">
        </head>"#;
        let out = open_graph(&doc(html), 0.95);
        assert_eq!(find(&out, "Jane Doe").entity_type, EntityType::Person);
    }

    #[test]
    fn schema_type_mapping() {
        assert_eq!(entity_type_for_schema("MusicEvent"), EntityType::Event);
        assert_eq!(entity_type_for_schema("EducationalOrganization"), EntityType::Organization);
        assert_eq!(entity_type_for_schema("BlogPosting"), EntityType::Document);
        assert_eq!(entity_type_for_schema("Spaceship"), EntityType::Custom);
        assert_eq!(relation_name("parentOrganization"), "parent_organization");
    }
}
