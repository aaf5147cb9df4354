//! Pattern-based entity and vote extraction tuned for civic meeting
//! minutes.
//!
//! Intentionally conservative: titled officials, named bodies, and dollar
//! amounts for entities; motion lines with adjacent roll-call tallies for
//! votes. Precision over recall, since downstream search surfaces the raw
//! text anyway.

use regex::Regex;

use crate::models::{EntityRecord, PageAnnotations, VoteRecord};

use super::{Extractor, Result};

/// How far past a motion line to look for its tally.
const VOTE_WINDOW: usize = 400;

pub struct RegexExtractor {
    person: Regex,
    organization: Regex,
    money: Regex,
    motion_line: Regex,
    ayes: Regex,
    nays: Regex,
    abstains: Regex,
    tally: Regex,
}

impl RegexExtractor {
    pub fn new() -> Self {
        Self {
            person: Regex::new(
                r"\b(?:Mayor|Vice Mayor|Councilmember|Council Member|Commissioner|Chair(?:man|woman|person)?|Trustee|Alder(?:man|woman)|Supervisor|City Clerk|City Manager)\s+((?:[A-Z][a-zA-Z'\-]+)(?:\s+[A-Z][a-zA-Z'\-]+)?)",
            )
            .expect("person pattern"),
            organization: Regex::new(
                r"\b((?:[A-Z][a-zA-Z'\-]+\s+){0,3}(?:Department|Commission|Committee|Board|Authority|District|Agency)(?:\s+of(?:\s+[A-Z][a-zA-Z'\-]+)+)?)",
            )
            .expect("organization pattern"),
            money: Regex::new(r"\$\d[\d,]*(?:\.\d{2})?").expect("money pattern"),
            motion_line: Regex::new(r"(?im)^.*\bmotion\b.*$").expect("motion pattern"),
            ayes: Regex::new(r"(?i)\bayes?\b[:\s]+(\d+)").expect("ayes pattern"),
            nays: Regex::new(r"(?i)\b(?:noes|nays?)\b[:\s]+(\d+)").expect("nays pattern"),
            abstains: Regex::new(r"(?i)\babstain(?:ed|s|ing|entions)?\b[:\s]+(\d+)")
                .expect("abstain pattern"),
            tally: Regex::new(r"(?i)\b(?:carried|passed|approved|failed)\b[,\s]+(\d+)\s*(?:-|–|to)\s*(\d+)")
                .expect("tally pattern"),
        }
    }

    fn entities(&self, text: &str) -> Vec<EntityRecord> {
        let mut found = Vec::new();
        for cap in self.person.captures_iter(text) {
            found.push(EntityRecord {
                kind: "person".to_string(),
                value: cap[1].to_string(),
            });
        }
        for cap in self.organization.captures_iter(text) {
            // Sentence-start determiners ride along in the capture
            let value = cap[1]
                .trim()
                .trim_start_matches("The ")
                .trim_start_matches("A ")
                .to_string();
            // A bare "Board" or "Committee" with no qualifier is noise
            if value.split_whitespace().count() > 1 {
                found.push(EntityRecord {
                    kind: "organization".to_string(),
                    value,
                });
            }
        }
        for m in self.money.find_iter(text) {
            found.push(EntityRecord {
                kind: "money".to_string(),
                value: m.as_str().to_string(),
            });
        }
        found.sort_by(|a, b| (&a.kind, &a.value).cmp(&(&b.kind, &b.value)));
        found.dedup();
        found
    }

    fn votes(&self, text: &str) -> Vec<VoteRecord> {
        let mut votes = Vec::new();
        for m in self.motion_line.find_iter(text) {
            let motion = m.as_str().trim();
            if motion.is_empty() {
                continue;
            }
            let window_end = (m.end() + VOTE_WINDOW).min(text.len());
            // Slice on a char boundary; the window size is advisory
            let window_end = (window_end..text.len().min(window_end + 4))
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(text.len());
            let window = &text[m.start()..window_end];

            let ayes = self.capture_count(&self.ayes, window);
            let nays = self.capture_count(&self.nays, window);
            let abstains = self.capture_count(&self.abstains, window);

            let (ayes, nays) = match (ayes, nays) {
                (Some(a), n) => (a, n.unwrap_or(0)),
                (None, Some(n)) => (0, n),
                (None, None) => {
                    // Fall back to "carried 5-2" style tallies
                    match self.tally.captures(window) {
                        Some(cap) => (
                            cap[1].parse().unwrap_or(0),
                            cap[2].parse().unwrap_or(0),
                        ),
                        None => continue,
                    }
                }
            };

            let motion = motion.chars().take(200).collect::<String>();
            votes.push(VoteRecord {
                motion,
                ayes,
                nays,
                abstains: abstains.unwrap_or(0),
            });
        }
        votes
    }

    fn capture_count(&self, pattern: &Regex, window: &str) -> Option<u32> {
        pattern
            .captures(window)
            .and_then(|cap| cap[1].parse().ok())
    }
}

impl Default for RegexExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for RegexExtractor {
    fn name(&self) -> &str {
        "regex"
    }

    fn extract(&self, text: &str) -> Result<PageAnnotations> {
        Ok(PageAnnotations {
            entities: self.entities(text),
            votes: self.votes(text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTES: &str = "\
CITY OF RIVERDALE - REGULAR COUNCIL MEETING

Present: Mayor Diaz, Councilmember Okafor, Councilmember Tran.
The Parks Department presented a report on trail maintenance
with the Planning Commission concurring.

Motion to approve the FY25 budget of $1,250,000.00.
Ayes: 4  Noes: 1  Abstain: 0
Motion carried.
";

    #[test]
    fn test_extracts_titled_people() {
        let extractor = RegexExtractor::new();
        let out = extractor.extract(MINUTES).unwrap();
        let people: Vec<_> = out
            .entities
            .iter()
            .filter(|e| e.kind == "person")
            .map(|e| e.value.as_str())
            .collect();
        assert!(people.contains(&"Diaz"));
        assert!(people.contains(&"Okafor"));
        assert!(people.contains(&"Tran"));
    }

    #[test]
    fn test_extracts_organizations_and_money() {
        let extractor = RegexExtractor::new();
        let out = extractor.extract(MINUTES).unwrap();
        assert!(out
            .entities
            .iter()
            .any(|e| e.kind == "organization" && e.value == "Parks Department"));
        assert!(out
            .entities
            .iter()
            .any(|e| e.kind == "organization" && e.value == "Planning Commission"));
        assert!(out
            .entities
            .iter()
            .any(|e| e.kind == "money" && e.value == "$1,250,000.00"));
    }

    #[test]
    fn test_extracts_roll_call_vote() {
        let extractor = RegexExtractor::new();
        let out = extractor.extract(MINUTES).unwrap();
        let vote = out
            .votes
            .iter()
            .find(|v| v.motion.contains("FY25 budget"))
            .unwrap();
        assert_eq!((vote.ayes, vote.nays, vote.abstains), (4, 1, 0));
    }

    #[test]
    fn test_extracts_tally_style_vote() {
        let extractor = RegexExtractor::new();
        let text = "Motion to rezone parcel 12. The motion carried, 5-2.";
        let out = extractor.extract(text).unwrap();
        assert!(!out.votes.is_empty());
        assert_eq!(out.votes[0].ayes, 5);
        assert_eq!(out.votes[0].nays, 2);
    }

    #[test]
    fn test_motion_without_tally_is_skipped() {
        let extractor = RegexExtractor::new();
        let text = "A motion was discussed but tabled for next session.";
        let out = extractor.extract(text).unwrap();
        assert!(out.votes.is_empty());
    }

    #[test]
    fn test_entities_deduplicated() {
        let extractor = RegexExtractor::new();
        let text = "Mayor Diaz spoke. Mayor Diaz adjourned.";
        let out = extractor.extract(text).unwrap();
        let diaz: Vec<_> = out
            .entities
            .iter()
            .filter(|e| e.value == "Diaz")
            .collect();
        assert_eq!(diaz.len(), 1);
    }

    #[test]
    fn test_empty_text() {
        let extractor = RegexExtractor::new();
        let out = extractor.extract("").unwrap();
        assert!(out.entities.is_empty());
        assert!(out.votes.is_empty());
    }
}
