//! Schema catalog and business-rule corpus.
//!
//! The metadata store is static: it is read once at process start and
//! handed to both indices as an `Arc<[Document]>`. A deployment can replace
//! the built-in corpus with a JSON file (`[corpus] path`), whose entries are
//! `{"table", "section", "content"}` objects.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, Text2SqlError};
use crate::models::Document;

/// Tables the generator may reference and the sampler may read.
pub const TABLES: &[&str] = &[
    "countries",
    "nuclear_power_plant_status_types",
    "nuclear_power_plants",
    "nuclear_reactor_types",
];

const SCHEMA_DESCRIPTION: &str = "Table: countries
- id (VARCHAR(2), PRIMARY KEY): Country code
- name (VARCHAR(255)): Country name

Table: nuclear_power_plant_status_types
- Id (INT, PRIMARY KEY): Status identifier
- Type (VARCHAR(50)): Status name

Table: nuclear_reactor_types
- Id (INT, PRIMARY KEY): Reactor type identifier
- Type (VARCHAR(20)): Reactor type code
- Description (VARCHAR(255)): Full reactor type name

Table: nuclear_power_plants
- Id (INT, PRIMARY KEY): Plant identifier
- Name (VARCHAR(255)): Plant name
- Latitude (DECIMAL): Geographic latitude
- Longitude (DECIMAL): Geographic longitude
- CountryCode (VARCHAR(2), FOREIGN KEY -> countries.id): Country
- StatusId (INT, FOREIGN KEY -> nuclear_power_plant_status_types.Id): Current status
- ReactorTypeId (INT, FOREIGN KEY -> nuclear_reactor_types.Id): Reactor technology
- ReactorModel (VARCHAR(100)): Specific reactor model
- ConstructionStartAt (DATE): Construction start date
- OperationalFrom (DATE): Operational start date
- OperationalTo (DATE): Shutdown date (NULL if operational)
- Capacity (INT): Capacity in megawatts
- Source (VARCHAR(50)): Data source
- LastUpdatedAt (DATETIME): Last update timestamp

Relationships:
- nuclear_power_plants.CountryCode -> countries.id
- nuclear_power_plants.StatusId -> nuclear_power_plant_status_types.Id
- nuclear_power_plants.ReactorTypeId -> nuclear_reactor_types.Id";

/// Table and column descriptions handed to every prompt.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    pub description: String,
    pub tables: Vec<String>,
}

impl SchemaCatalog {
    pub fn builtin() -> Self {
        Self {
            description: SCHEMA_DESCRIPTION.to_string(),
            tables: TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t == name)
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// The business-rule documents shipped with the application.
pub fn builtin_documents() -> Vec<Document> {
    vec![
        Document::new(
            "countries",
            "overview",
            "Countries table contains ISO 3166-1 alpha-2 country codes. \
             Top nuclear nations: US (137 plants), China (91), France (72), Japan (71), Russia (56). \
             Use CountryCode for joining with nuclear_power_plants.",
        ),
        Document::new(
            "nuclear_power_plant_status_types",
            "operational_definition",
            "StatusId = 3 means Operational (currently generating electricity). \
             StatusId = 2 means Under Construction (future capacity). \
             StatusId = 5 means Shutdown (permanently closed). \
             Always filter by StatusId = 3 for current capacity calculations. \
             To count operational nuclear power plants: SELECT COUNT(*) FROM nuclear_power_plants \
             WHERE StatusId = 3.",
        ),
        Document::new(
            "nuclear_power_plant_status_types",
            "capacity_analysis",
            "For capacity expansion analysis, use StatusId IN (1, 2) for planned and under construction. \
             For retired capacity, use StatusId = 5. \
             464 operational plants, 55 under construction, 174 shutdown globally.",
        ),
        Document::new(
            "nuclear_reactor_types",
            "common_types",
            "PWR (Pressurised Water Reactor) is most common worldwide. \
             BWR (Boiling Water Reactor) is second most common. \
             VVER is Russian PWR variant used in Eastern Europe. \
             Advanced reactors include APWR, EPR, ABWR.",
        ),
        Document::new(
            "nuclear_power_plants",
            "capacity_queries",
            "To calculate total capacity: SUM(Capacity) WHERE StatusId = 3. \
             Average plant size is about 970 MW. \
             Capacity ranges from 3 MW to 1,660 MW. \
             Always check for NULL in Capacity field.",
        ),
        Document::new(
            "nuclear_power_plants",
            "geographic_analysis",
            "Use CountryCode to group by country. \
             Join with countries table: JOIN countries c ON npp.CountryCode = c.id. \
             Use Latitude and Longitude for mapping. \
             Geographic analysis example: GROUP BY CountryCode, ORDER BY COUNT(*) DESC",
        ),
        Document::new(
            "nuclear_power_plants",
            "temporal_analysis",
            "OperationalFrom indicates when plant started. \
             OperationalTo indicates shutdown date (NULL if still operational). \
             ConstructionStartAt shows construction beginning. \
             To find new plants: WHERE OperationalFrom >= DATE('now', '-5 years'). \
             To calculate age: (julianday('now') - julianday(OperationalFrom)) / 365",
        ),
        Document::new(
            "nuclear_power_plants",
            "expansion_queries",
            "Countries expanding nuclear capacity have StatusId = 2 (Under Construction). \
             Example query for expansion: SELECT CountryCode, COUNT(*) as under_construction, \
             SUM(Capacity) as future_capacity FROM nuclear_power_plants WHERE StatusId = 2 \
             GROUP BY CountryCode ORDER BY future_capacity DESC. \
             China has the most plants under construction.",
        ),
        Document::new(
            "nuclear_power_plants",
            "example_top_countries",
            "Example: \"Which countries have the most nuclear plants?\" \
             SQL: SELECT c.name, COUNT(npp.Id) as plant_count, SUM(npp.Capacity) as total_capacity \
             FROM nuclear_power_plants npp JOIN countries c ON npp.CountryCode = c.id \
             WHERE npp.StatusId = 3 GROUP BY c.id, c.name ORDER BY plant_count DESC LIMIT 10;",
        ),
    ]
}

#[derive(Deserialize)]
struct CorpusEntry {
    table: String,
    section: String,
    content: String,
}

/// Load a corpus from a JSON file.
pub fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Text2SqlError::Configuration(format!("cannot read corpus {}: {}", path.display(), e))
    })?;
    let entries: Vec<CorpusEntry> = serde_json::from_str(&raw).map_err(|e| {
        Text2SqlError::Configuration(format!("invalid corpus {}: {}", path.display(), e))
    })?;
    Ok(entries
        .into_iter()
        .map(|e| Document::new(&e.table, &e.section, &e.content))
        .collect())
}

/// Validate a corpus and freeze it for sharing between indices.
///
/// Rejects an empty corpus, empty content and duplicate ids.
pub fn freeze(documents: Vec<Document>) -> Result<Arc<[Arc<Document>]>> {
    if documents.is_empty() {
        return Err(Text2SqlError::Configuration(
            "corpus contains no documents".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for doc in &documents {
        if doc.content.trim().is_empty() {
            return Err(Text2SqlError::Configuration(format!(
                "document {} has empty content",
                doc.id
            )));
        }
        if !seen.insert(doc.id.as_str()) {
            return Err(Text2SqlError::Configuration(format!(
                "duplicate document id {}",
                doc.id
            )));
        }
    }
    Ok(documents.into_iter().map(Arc::new).collect())
}

/// Content fingerprint of a corpus snapshot (hex SHA-256 over ids and bodies).
pub fn fingerprint(documents: &[Arc<Document>]) -> String {
    let mut hasher = Sha256::new();
    for doc in documents {
        hasher.update(doc.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(doc.content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_corpus_is_valid() {
        let docs = freeze(builtin_documents()).unwrap();
        assert_eq!(docs.len(), 9);
        let catalog = SchemaCatalog::builtin();
        for doc in docs.iter() {
            assert!(catalog.has_table(&doc.table), "unknown table {}", doc.table);
        }
    }

    #[test]
    fn test_freeze_rejects_empty_and_duplicates() {
        assert!(matches!(
            freeze(Vec::new()),
            Err(Text2SqlError::Configuration(_))
        ));
        let dup = vec![
            Document::new("t", "s", "one"),
            Document::new("t", "s", "two"),
        ];
        assert!(freeze(dup).is_err());
        assert!(freeze(vec![Document::new("t", "s", "  ")]).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = freeze(builtin_documents()).unwrap();
        let b = freeze(builtin_documents()).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let mut docs = builtin_documents();
        docs[0].content.push('!');
        let c = freeze(docs).unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_load_documents_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(
            &path,
            r#"[{"table": "countries", "section": "codes", "content": "FR is France"}]"#,
        )
        .unwrap();
        let docs = load_documents(&path).unwrap();
        assert_eq!(docs[0].id, "countries/codes");
        assert!(load_documents(&dir.path().join("missing.json")).is_err());
    }
}
