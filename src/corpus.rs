use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    OrachChayim,
    YorehDeah,
    EvenHaezer,
    ChoshenMishpat,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::OrachChayim,
        Section::YorehDeah,
        Section::EvenHaezer,
        Section::ChoshenMishpat,
    ];

    pub fn provider_name(self) -> &'static str {
        match self {
            Section::OrachChayim => "Orach Chayim",
            Section::YorehDeah => "Yoreh De'ah",
            Section::EvenHaezer => "Even HaEzer",
            Section::ChoshenMishpat => "Choshen Mishpat",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Section::OrachChayim => "orach_chayim",
            Section::YorehDeah => "yoreh_deah",
            Section::EvenHaezer => "even_haezer",
            Section::ChoshenMishpat => "choshen_mishpat",
        }
    }

    pub fn label_he(self) -> &'static str {
        match self {
            Section::OrachChayim => "אורח חיים",
            Section::YorehDeah => "יורה דעה",
            Section::EvenHaezer => "אבן העזר",
            Section::ChoshenMishpat => "חושן משפט",
        }
    }

    /// Accepts the provider spelling and common transliteration variants
    /// ("Orach Chaim" / "Orach Chayim", stray apostrophes, any case).
    pub fn parse(input: &str) -> anyhow::Result<Section> {
        let normalized = normalize_section_name(input);
        for section in Section::ALL {
            if normalize_section_name(section.provider_name()) == normalized {
                return Ok(section);
            }
        }
        anyhow::bail!("unknown section: {input}")
    }

    /// True when `name` names this section under prefix normalization.
    pub fn matches_name(self, name: &str) -> bool {
        normalize_section_name(name) == normalize_section_name(self.provider_name())
    }
}

/// Lowercase, drop apostrophes, collapse whitespace, and unify the
/// "chaim"/"chayim" orthography so both transliterations compare equal.
pub fn normalize_section_name(input: &str) -> String {
    let lowered = input.to_lowercase().replace(['\'', '\u{2019}'], "");
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.replace("chaim", "chayim")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusId {
    ShulchanArukh,
    Tur,
    BeitYosef,
    MishnahBerurah,
}

impl CorpusId {
    pub const ALL: [CorpusId; 4] = [
        CorpusId::ShulchanArukh,
        CorpusId::Tur,
        CorpusId::BeitYosef,
        CorpusId::MishnahBerurah,
    ];

    pub fn key(self) -> &'static str {
        match self {
            CorpusId::ShulchanArukh => "shulchan_arukh",
            CorpusId::Tur => "tur",
            CorpusId::BeitYosef => "beit_yosef",
            CorpusId::MishnahBerurah => "mishnah_berurah",
        }
    }

    pub fn label_he(self) -> &'static str {
        match self {
            CorpusId::ShulchanArukh => "שולחן ערוך",
            CorpusId::Tur => "טור",
            CorpusId::BeitYosef => "בית יוסף",
            CorpusId::MishnahBerurah => "משנה ברורה",
        }
    }

    pub fn provider_prefix(self) -> &'static str {
        match self {
            CorpusId::ShulchanArukh => "Shulchan Arukh",
            CorpusId::Tur => "Tur",
            CorpusId::BeitYosef => "Beit Yosef",
            CorpusId::MishnahBerurah => "Mishnah Berurah",
        }
    }

    /// Whether provider refs for this corpus carry the section name.
    /// Mishnah Berurah refs omit it: the work only covers Orach Chayim.
    pub fn section_qualified(self) -> bool {
        !matches!(self, CorpusId::MishnahBerurah)
    }

    /// Whether refs address individual paragraphs, not just chapters.
    pub fn addresses_paragraphs(self) -> bool {
        matches!(self, CorpusId::ShulchanArukh | CorpusId::MishnahBerurah)
    }

    pub fn only_section(self) -> Option<Section> {
        match self {
            CorpusId::MishnahBerurah => Some(Section::OrachChayim),
            _ => None,
        }
    }

    pub fn parse(input: &str) -> anyhow::Result<CorpusId> {
        for corpus in CorpusId::ALL {
            if corpus.key() == input || corpus.provider_prefix().eq_ignore_ascii_case(input) {
                return Ok(corpus);
            }
        }
        anyhow::bail!("unknown corpus: {input}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub section: Section,
    pub chapter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paragraph: Option<u32>,
}

impl Location {
    pub fn new(section: Section, chapter: u32, paragraph: Option<u32>) -> Self {
        Self {
            section,
            chapter,
            paragraph,
        }
    }
}

/// Build the provider reference string for a location in a corpus.
///
/// The chapter/paragraph inputs accept either decimal strings or
/// Hebrew-letter numerals; both are converted before formatting.
pub fn build_ref(
    corpus: CorpusId,
    section: Section,
    chapter: &str,
    paragraph: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(only) = corpus.only_section()
        && only != section
    {
        anyhow::bail!(
            "corpus {} only covers {}, requested {}",
            corpus.key(),
            only.provider_name(),
            section.provider_name()
        );
    }

    let chapter = parse_number(chapter)
        .with_context(|| format!("parse chapter number: {chapter:?}"))?;

    let mut out = if corpus.section_qualified() {
        format!(
            "{}, {} {}",
            corpus.provider_prefix(),
            section.provider_name(),
            chapter
        )
    } else {
        format!("{} {}", corpus.provider_prefix(), chapter)
    };

    if corpus.addresses_paragraphs()
        && let Some(paragraph) = paragraph
    {
        let paragraph = parse_number(paragraph)
            .with_context(|| format!("parse paragraph number: {paragraph:?}"))?;
        out.push(':');
        out.push_str(&paragraph.to_string());
    }

    Ok(out)
}

/// Decimal digits, or a Hebrew-letter numeral from the static table.
pub fn parse_number(input: &str) -> anyhow::Result<u32> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty number");
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let n: u32 = trimmed.parse().context("parse decimal")?;
        if n == 0 {
            anyhow::bail!("number must be positive");
        }
        return Ok(n);
    }
    hebrew_numeral_to_int(trimmed)
        .ok_or_else(|| anyhow::anyhow!("not a decimal or Hebrew numeral: {input:?}"))
}

fn letter_value(ch: char) -> Option<u32> {
    Some(match ch {
        'א' => 1,
        'ב' => 2,
        'ג' => 3,
        'ד' => 4,
        'ה' => 5,
        'ו' => 6,
        'ז' => 7,
        'ח' => 8,
        'ט' => 9,
        'י' => 10,
        'כ' | 'ך' => 20,
        'ל' => 30,
        'מ' | 'ם' => 40,
        'נ' | 'ן' => 50,
        'ס' => 60,
        'ע' => 70,
        'פ' | 'ף' => 80,
        'צ' | 'ץ' => 90,
        'ק' => 100,
        'ר' => 200,
        'ש' => 300,
        'ת' => 400,
        _ => return None,
    })
}

/// Sum-of-letters gematria. Punctuation used in numerals (geresh,
/// gershayim, ASCII quotes) is ignored; any other character rejects the
/// input. The 15/16 forms (טו/טז) come out of plain summation.
pub fn hebrew_numeral_to_int(input: &str) -> Option<u32> {
    let mut total = 0u32;
    let mut saw_letter = false;
    for ch in input.chars() {
        if matches!(ch, '\'' | '"' | '\u{05F3}' | '\u{05F4}' | '\u{2019}' | '\u{201D}') {
            continue;
        }
        let value = letter_value(ch)?;
        total = total.checked_add(value)?;
        saw_letter = true;
    }
    if !saw_letter || total == 0 {
        return None;
    }
    Some(total)
}

/// Inverse of [`hebrew_numeral_to_int`] for 1..=999, with the customary
/// 15/16 exceptions.
pub fn int_to_hebrew_numeral(mut n: u32) -> Option<String> {
    if n == 0 || n > 999 {
        return None;
    }

    const HUNDREDS: [(u32, &str); 4] = [(400, "ת"), (300, "ש"), (200, "ר"), (100, "ק")];
    const TENS: [(u32, &str); 9] = [
        (90, "צ"),
        (80, "פ"),
        (70, "ע"),
        (60, "ס"),
        (50, "נ"),
        (40, "מ"),
        (30, "ל"),
        (20, "כ"),
        (10, "י"),
    ];
    const ONES: [(u32, &str); 9] = [
        (9, "ט"),
        (8, "ח"),
        (7, "ז"),
        (6, "ו"),
        (5, "ה"),
        (4, "ד"),
        (3, "ג"),
        (2, "ב"),
        (1, "א"),
    ];

    let mut out = String::new();
    for (value, letter) in HUNDREDS {
        while n >= value {
            out.push_str(letter);
            n -= value;
        }
    }

    // יה/יו would spell fragments of the divine name.
    if n == 15 {
        out.push_str("טו");
        return Some(out);
    }
    if n == 16 {
        out.push_str("טז");
        return Some(out);
    }

    for (value, letter) in TENS {
        if n >= value {
            out.push_str(letter);
            n -= value;
            break;
        }
    }
    for (value, letter) in ONES {
        if n >= value {
            out.push_str(letter);
            n -= value;
            break;
        }
    }
    debug_assert_eq!(n, 0);
    Some(out)
}
