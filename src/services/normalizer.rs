//! Turns free-form evaluation text from the generation service into a bounded
//! [`GenerationResult`].
//!
//! Everything here is pure: no I/O, no clock. [`normalize`] never fails; output that
//! cannot be parsed is replaced by a synthesized result tagged
//! [`Provenance::Fallback`].
//!
//! Scale reconciliation is a heuristic. The generator is asked for 0-20 criterion
//! scores but regularly answers on a 0-10 scale, so a generation whose scores are all
//! at most 10 is assumed to be on the smaller scale and doubled. Nothing upstream
//! guarantees this; a genuinely weak answer on the 0-20 scale gets inflated.

use std::sync::LazyLock;

use regex::Regex;

use crate::db::types::Provenance;
use crate::schemas::assessment::{CriterionScore, GenerationResult};

pub(crate) const CRITERIA: [&str; 5] =
    ["Grammar", "Vocabulary", "Coherence", "Task Achievement", "Fluency"];

pub(crate) const MAX_CRITERION_SCORE: f64 = 20.0;
pub(crate) const MAX_OVERALL_SCORE: f64 = 100.0;
pub(crate) const MIN_RECOMMENDATIONS: usize = 3;

const MAX_RECOMMENDATIONS: usize = 5;
const MIN_CONTENT_CHARS: usize = 40;
const MIN_RECOMMENDATION_CHARS: usize = 12;
const SMALL_SCALE_MAX: f64 = 10.0;
const FALLBACK_CRITERION_SCORE: f64 = 4.0;

const MISSING_CRITERION_FEEDBACK: &str =
    "No separate assessment was given for this criterion; the score is the average of the others.";
const EMPTY_CRITERION_FEEDBACK: &str = "No detailed feedback was provided for this criterion.";
const FALLBACK_CRITERION_FEEDBACK: &str =
    "Automatic evaluation was unavailable, so this criterion was not assessed in detail.";
const FALLBACK_OVERALL_FEEDBACK: &str = "We could not produce a detailed evaluation this time. \
     The scores shown are a conservative placeholder; please try again later for a full review.";

const CANNED_RECOMMENDATIONS: [[&str; 4]; 5] = [
    [
        "Start with the most frequent everyday words and practise them in short sentences.",
        "Review basic sentence order and the present tense with simple written exercises.",
        "Read short graded texts aloud every day to build confidence with the language.",
        "Write two or three sentences daily about your routine and check them with a dictionary.",
    ],
    [
        "Practise linking sentences with simple connectors such as and, but and because.",
        "Keep a vocabulary notebook organised by topic and review it several times a week.",
        "Work through past and future tense exercises until the forms feel automatic.",
        "Rewrite your answers after feedback, focusing on one type of mistake at a time.",
    ],
    [
        "Plan each answer with a short outline so every paragraph has a clear purpose.",
        "Replace repeated words with synonyms to show a wider range of vocabulary.",
        "Check agreement and tense consistency when you proofread your writing.",
        "Read opinion articles at your level and note how writers structure arguments.",
    ],
    [
        "Use a wider range of complex structures, such as conditionals and relative clauses.",
        "Work on precise word choice and collocations to make your writing sound natural.",
        "Make sure every part of the task is addressed explicitly and in enough depth.",
        "Practise timed writing to keep quality consistent under exam conditions.",
    ],
    [
        "Refine stylistic register so the tone matches the audience of each task.",
        "Experiment with idiomatic expressions and less common vocabulary where appropriate.",
        "Polish cohesion across paragraphs with varied and subtle linking devices.",
        "Challenge yourself with tasks from the next level to keep progressing.",
    ],
];

const CANNED_OVERALL_FEEDBACK: [&str; 5] = [
    "The response shows very limited control of the language; focus on the basics first.",
    "The response communicates some ideas but frequent errors get in the way of meaning.",
    "The response is generally understandable with a fair range of language and some errors.",
    "The response is clear and well organised with good control of grammar and vocabulary.",
    "The response is fluent, precise and well structured with only occasional slips.",
];

static CRITERION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"grammar|grammatical[ \t]+accuracy",
        r"vocabulary|lexical[ \t]+resource",
        r"coherence(?:[ \t]*(?:and|&)[ \t]*cohesion)?",
        r"task[ \t]+(?:achievement|response|completion)",
        r"fluency",
    ]
    .iter()
    .map(|label| {
        Regex::new(&format!(
            r"(?im)^[ \t]*(?:[-*•>]|\d{{1,2}}[.)])?[ \t]*\**[ \t]*(?:{label})[ \t]*(?:score)?[ \t]*\**[ \t]*[:=\-–—]?[ \t]*\**[ \t]*(\d{{1,3}}(?:[.,]\d+)?)[ \t]*(?:/[ \t]*\d{{1,3}})?[ \t]*\**[ \t]*[-–—:.,|]?[ \t]*(.*)$"
        ))
        .expect("criterion pattern")
    })
    .collect()
});

static OVERALL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:[-*•>#][ \t]*)*\**[ \t]*overall(?:[ \t]+(?:score|result|percentage|grade))?[ \t]*\**[ \t]*[:=\-–—]?[ \t]*\**[ \t]*(\d{1,4}(?:[.,]\d+)?)[ \t]*(?:(%)|/[ \t]*(\d{1,4}))?",
    )
    .expect("overall pattern")
});

static TASK_HEADING: LazyLock<Regex> = LazyLock::new(|| heading(r"task(?:[ \t]+prompt)?"));

static FEEDBACK_HEADING: LazyLock<Regex> =
    LazyLock::new(|| heading(r"(?:overall[ \t]+)?(?:feedback|comments?)|summary"));

static RECOMMENDATIONS_HEADING: LazyLock<Regex> =
    LazyLock::new(|| heading(r"recommendations?|suggestions?|next[ \t]+steps"));

static NUMBERED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|\s)\(?\d{1,2}[.)][ \t]+").expect("numbered marker"));

static LIST_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•>]|\(?\d{1,2}[.)])[ \t]*").expect("list prefix"));

fn heading(names: &str) -> Regex {
    Regex::new(&format!(
        r"(?im)^[ \t]*(?:#+[ \t]*)?\**[ \t]*(?:{names})[ \t]*\**[ \t]*(?::[ \t]*\**|$)"
    ))
    .expect("heading pattern")
}

/// Parses raw generation output. Never fails.
pub(crate) fn normalize(raw: &str) -> GenerationResult {
    let text = raw.trim();
    if text.chars().count() < MIN_CONTENT_CHARS {
        tracing::warn!(length = text.len(), "Generation output too short; using fallback");
        return fallback_result();
    }

    let parsed = parse_criteria(text);
    let stated_overall = parse_overall(text);
    if parsed.iter().all(Option::is_none) && stated_overall.is_none() {
        tracing::warn!("Generation output has no recognisable scores; using fallback");
        return fallback_result();
    }

    let mut used_canned = false;
    let criterion_scores = reconcile_criteria(parsed, stated_overall);
    let overall_score = overall_from(stated_overall, &criterion_scores);

    let overall_feedback = match extract_section(text, &FEEDBACK_HEADING) {
        Some(feedback) => collapse_whitespace(&feedback),
        None => {
            used_canned = true;
            CANNED_OVERALL_FEEDBACK[score_bucket(overall_score)].to_string()
        }
    };

    let mut recommendations = extract_recommendations(text);
    if recommendations.len() < MIN_RECOMMENDATIONS {
        used_canned = true;
        pad_recommendations(&mut recommendations, overall_score);
    }

    let task = extract_section(text, &TASK_HEADING).map(|task| task.trim().to_string());

    GenerationResult {
        task,
        criterion_scores,
        overall_score,
        overall_feedback,
        recommendations,
        provenance: if used_canned { Provenance::Fallback } else { Provenance::Generated },
    }
}

/// Minimal valid result used when nothing usable came back.
pub(crate) fn fallback_result() -> GenerationResult {
    let criterion_scores: Vec<CriterionScore> = CRITERIA
        .iter()
        .map(|name| CriterionScore {
            name: (*name).to_string(),
            score: FALLBACK_CRITERION_SCORE,
            feedback: FALLBACK_CRITERION_FEEDBACK.to_string(),
        })
        .collect();
    let overall_score = round1(criterion_scores.iter().map(|c| c.score).sum());

    let mut recommendations = Vec::new();
    pad_recommendations(&mut recommendations, overall_score);

    GenerationResult {
        task: None,
        criterion_scores,
        overall_score,
        overall_feedback: FALLBACK_OVERALL_FEEDBACK.to_string(),
        recommendations,
        provenance: Provenance::Fallback,
    }
}

struct ParsedCriterion {
    score: f64,
    feedback: String,
}

fn parse_criteria(text: &str) -> Vec<Option<ParsedCriterion>> {
    CRITERION_PATTERNS
        .iter()
        .map(|pattern| {
            let captures = pattern.captures(text)?;
            let score = parse_number(captures.get(1)?.as_str())?;
            let feedback = captures
                .get(2)
                .map(|m| collapse_whitespace(m.as_str().trim_matches('*')))
                .unwrap_or_default();
            Some(ParsedCriterion { score, feedback })
        })
        .collect()
}

fn reconcile_criteria(
    parsed: Vec<Option<ParsedCriterion>>,
    stated_overall: Option<f64>,
) -> Vec<CriterionScore> {
    let already_large_scale = parsed.iter().flatten().any(|criterion| criterion.score > SMALL_SCALE_MAX);
    let rescale = |score: f64| {
        let converted = if already_large_scale { score } else { score * 2.0 };
        round1(converted.clamp(0.0, MAX_CRITERION_SCORE))
    };

    let found: Vec<f64> = parsed.iter().flatten().map(|criterion| rescale(criterion.score)).collect();
    let substitute = if found.is_empty() {
        // Only an overall percentage was stated; spread it evenly.
        let overall = stated_overall.map(reconcile_overall).unwrap_or(0.0);
        round1((overall / CRITERIA.len() as f64).clamp(0.0, MAX_CRITERION_SCORE))
    } else {
        round1(found.iter().sum::<f64>() / found.len() as f64)
    };

    CRITERIA
        .iter()
        .zip(parsed)
        .map(|(name, criterion)| match criterion {
            Some(criterion) => CriterionScore {
                name: (*name).to_string(),
                score: rescale(criterion.score),
                feedback: if criterion.feedback.is_empty() {
                    EMPTY_CRITERION_FEEDBACK.to_string()
                } else {
                    criterion.feedback
                },
            },
            None => CriterionScore {
                name: (*name).to_string(),
                score: substitute,
                feedback: MISSING_CRITERION_FEEDBACK.to_string(),
            },
        })
        .collect()
}

fn parse_overall(text: &str) -> Option<f64> {
    OVERALL_PATTERN.captures_iter(text).find_map(|captures| {
        let value = parse_number(captures.get(1)?.as_str())?;
        match captures.get(3) {
            // "17/20" is a raw score, not a percentage.
            Some(denominator) if denominator.as_str() != "100" => None,
            _ => Some(value),
        }
    })
}

/// A stated percentage above 100 is assumed to be on a doubled scale and halved once.
fn reconcile_overall(stated: f64) -> f64 {
    let value = if stated > MAX_OVERALL_SCORE { stated / 2.0 } else { stated };
    value.clamp(0.0, MAX_OVERALL_SCORE)
}

fn overall_from(stated: Option<f64>, criteria: &[CriterionScore]) -> f64 {
    let value = match stated {
        Some(stated) => reconcile_overall(stated),
        None => criteria.iter().map(|criterion| criterion.score).sum(),
    };
    round1(value.clamp(0.0, MAX_OVERALL_SCORE))
}

type RecommendationStrategy = fn(Option<&str>, &str) -> Vec<String>;

/// Tried in order; the first strategy that yields anything wins.
const RECOMMENDATION_STRATEGIES: [(&str, RecommendationStrategy); 4] = [
    ("numbered_section", numbered_items),
    ("section_lines", section_lines),
    ("section_sentences", section_sentences),
    ("text_sentences", text_sentences),
];

fn extract_recommendations(text: &str) -> Vec<String> {
    let section = extract_section(text, &RECOMMENDATIONS_HEADING);

    for (name, strategy) in RECOMMENDATION_STRATEGIES {
        let items = clean_items(strategy(section.as_deref(), text));
        if !items.is_empty() {
            tracing::debug!(strategy = name, count = items.len(), "Recommendations extracted");
            return items;
        }
    }

    Vec::new()
}

fn numbered_items(section: Option<&str>, _text: &str) -> Vec<String> {
    let Some(section) = section else {
        return Vec::new();
    };

    let markers: Vec<_> = NUMBERED_MARKER.find_iter(section).collect();
    markers
        .iter()
        .enumerate()
        .map(|(idx, marker)| {
            let end = markers.get(idx + 1).map(|next| next.start()).unwrap_or(section.len());
            section[marker.end()..end].to_string()
        })
        .collect()
}

/// A section on a single line has not been split at all; leave it to the sentence pass.
fn section_lines(section: Option<&str>, _text: &str) -> Vec<String> {
    let Some(section) = section else {
        return Vec::new();
    };

    let lines: Vec<String> = section
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() < 2 {
        return Vec::new();
    }
    lines
}

fn section_sentences(section: Option<&str>, _text: &str) -> Vec<String> {
    section.map(|section| split_sentences(&section.replace('\n', " "))).unwrap_or_default()
}

fn text_sentences(_section: Option<&str>, text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !is_boundary(line))
        .flat_map(split_sentences)
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let at_boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }

    sentences
}

fn clean_items(items: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for item in items {
        let trimmed = item.trim();
        let without_prefix = LIST_PREFIX.replace(trimmed, "");
        let value = collapse_whitespace(without_prefix.trim_matches(|c: char| c == '*' || c.is_whitespace()));
        if value.chars().count() < MIN_RECOMMENDATION_CHARS {
            continue;
        }
        if cleaned.iter().any(|existing| existing.eq_ignore_ascii_case(&value)) {
            continue;
        }
        cleaned.push(value);
        if cleaned.len() == MAX_RECOMMENDATIONS {
            break;
        }
    }
    cleaned
}

fn pad_recommendations(recommendations: &mut Vec<String>, overall_score: f64) {
    for canned in CANNED_RECOMMENDATIONS[score_bucket(overall_score)] {
        if recommendations.len() >= MIN_RECOMMENDATIONS {
            break;
        }
        if !recommendations.iter().any(|existing| existing == canned) {
            recommendations.push(canned.to_string());
        }
    }
}

fn score_bucket(overall_score: f64) -> usize {
    match overall_score {
        score if score < 20.0 => 0,
        score if score < 40.0 => 1,
        score if score < 60.0 => 2,
        score if score < 80.0 => 3,
        _ => 4,
    }
}

/// Body of the section introduced by `heading`, up to the next recognised section.
fn extract_section(text: &str, heading: &Regex) -> Option<String> {
    let found = heading.find(text)?;
    let rest = &text[found.end()..];

    let mut body = Vec::new();
    for (idx, line) in rest.lines().enumerate() {
        if idx > 0 && is_boundary(line) {
            break;
        }
        body.push(line);
    }

    let body = body.join("\n").trim().to_string();
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

fn is_boundary(line: &str) -> bool {
    TASK_HEADING.is_match(line)
        || FEEDBACK_HEADING.is_match(line)
        || RECOMMENDATIONS_HEADING.is_match(line)
        || OVERALL_PATTERN.is_match(line)
        || CRITERION_PATTERNS.iter().any(|pattern| pattern.is_match(line))
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse::<f64>().ok().filter(|value| value.is_finite())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
