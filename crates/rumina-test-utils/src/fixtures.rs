//! Source document fixtures written into a caller-provided directory.

use std::path::{Path, PathBuf};

use rumina_common::{EntityKind, KeptEntity, MatchStrategy, TextLengths, VerificationMetadata, VerifiedAnalysis};

const FILLER: &str = "Rumen fluid was collected from cannulated cows before the morning feeding. \
Samples were strained through cheesecloth and analysed for volatile fatty acids. \
Dry matter intake and milk yield were recorded daily throughout the trial. ";

/// Article body long enough to pass the default minimum text length.
/// `facts` is placed up front so extraction scripts can refer to it.
pub fn article_body(facts: &str) -> String {
    let mut body = String::with_capacity(facts.len() + FILLER.len() * 3);
    body.push_str(facts);
    body.push(' ');
    for _ in 0..3 {
        body.push_str(FILLER);
    }
    body
}

/// Write `n` plain-text articles named `PMID<base+i>.txt`. Each body carries a
/// unique `marker-<id>` token. Returns the document ids in order.
pub fn write_text_articles(dir: &Path, n: usize, base: u64, facts: &str) -> Vec<String> {
    (0..n as u64)
        .map(|i| {
            let id = (base + i).to_string();
            let text = article_body(&format!("marker-{id}. {facts}"));
            std::fs::write(dir.join(format!("PMID{id}.txt")), text).expect("write fixture");
            id
        })
        .collect()
}

/// Write a JATS article `<slug>_PMID<pmid>.xml` and return its path.
pub fn write_jats_article(dir: &Path, pmid: &str, title: &str, abstract_text: &str, body: &str) -> PathBuf {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<article article-type="research-article">
  <front>
    <article-meta>
      <article-id pub-id-type="pmid">{pmid}</article-id>
      <title-group><article-title>{title}</article-title></title-group>
      <abstract><p>{abstract_text}</p></abstract>
    </article-meta>
  </front>
  <body>
    <sec><title>Results</title><p>{body}</p></sec>
  </body>
</article>
"#
    );
    let path = dir.join(format!("Article_PMID{pmid}.xml"));
    std::fs::write(&path, xml).expect("write fixture");
    path
}

/// Minimal verified analysis whose molecules all count as kept.
pub fn sample_analysis(id: &str, molecules: &[&str]) -> VerifiedAnalysis {
    let mut verification = VerificationMetadata::default();
    verification.candidates.insert(EntityKind::Molecule, molecules.len());
    verification.kept = molecules
        .iter()
        .map(|m| KeptEntity { text: m.to_string(), kind: EntityKind::Molecule, strategy: MatchStrategy::Exact })
        .collect();
    verification.min_word_overlap_fraction = 0.8;

    VerifiedAnalysis {
        id: id.to_string(),
        source_file: Some(format!("PMID{id}.txt")),
        title: String::new(),
        abstract_text: String::new(),
        summary: "The study measured rumen fermentation.".to_string(),
        molecules: molecules.iter().map(|m| m.to_string()).collect(),
        keywords: Vec::new(),
        topics: Vec::new(),
        text_length: TextLengths::default(),
        verification,
        model: "scripted-model".to_string(),
        processing_time_seconds: 0.0,
        created_at: Default::default(),
    }
}
