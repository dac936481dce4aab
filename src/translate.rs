//! Japanese test names to English, one line at a time.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

/// Substitutions in their authored order; applied longest pattern first.
const TERMS: &[(&str, &str)] = &[
    ("ベネッセ模試", "Benesse Mock Test"),
    ("夏休み明けテスト", "Post-Summer Break Test"),
    ("冬明けテスト", "Post-Winter Test"),
    ("正の数・負の数", "Positive and Negative Numbers"),
    ("文字の式", "Algebraic Expressions"),
    ("変化と対応", "Change and Correspondence"),
    ("平面図形", "Plane Figures"),
    ("空間図形", "Spatial Figures"),
    ("データの活用", "Data Utilization"),
    ("式の計算", "Expression Calculations"),
    ("連立方程式", "Simultaneous Equations"),
    ("一次関数", "Linear Functions"),
    ("図形の調べ方", "Methods of Investigating Figures"),
    ("図形の性質と証明", "Properties and Proofs of Figures"),
    ("箱ひげ図", "Box-and-Whisker Plots"),
    ("展開・因数分解", "Expansion and Factorization"),
    ("平方根", "Square Roots"),
    ("二次方程式", "Quadratic Equations"),
    ("二次関数", "Quadratic Functions"),
    ("図形と相似", "Figures and Similarity"),
    ("円の性質", "Properties of Circles"),
    ("三平方の定理", "Pythagorean Theorem"),
    ("土曜講座", "Saturday Lecture"),
    ("学年末", "End of Academic Year"),
    ("休校明け", "Post-School Closure"),
    ("上書きテスト", "Overwrite Test"),
    ("クラス番号", "Class Number"),
    ("外進1", "External Advancement 1"),
    ("外進2", "External Advancement 2"),
    ("文基礎", "Liberal Arts Basic"),
    ("文標準1", "Liberal Arts Standard 1"),
    ("文標準2", "Liberal Arts Standard 2"),
    ("理基礎", "Science Basic"),
    ("理標準", "Science Standard"),
    ("理発展", "Science Advanced"),
    ("文発展", "Liberal Arts Advanced"),
    ("内進", "Internal Advancement"),
    ("外進", "External Advancement"),
    ("理系", "Science Track"),
    ("文系", "Liberal Arts Track"),
    ("基礎", "Basic"),
    ("標準", "Standard"),
    ("発展", "Advanced"),
    ("前期", "First Semester"),
    ("後期", "Second Semester"),
    ("中間", "Midterm"),
    ("期末", "Final"),
    ("数学", "Mathematics"),
    ("英語", "English"),
    ("国語", "Japanese Language"),
    ("中学", "Middle School"),
    ("高校", "High School"),
    ("高2", "High School Grade 2"),
    ("高1", "High School Grade 1"),
    ("年度", "Academic Year"),
    ("模試", "Mock Test"),
    ("第1回", "1st Round"),
    ("第2回", "2nd Round"),
    ("1回", "1st Round"),
    ("2回", "2nd Round"),
    ("Bライン", "B-Line"),
    ("章", "Chapter"),
    ("方程式", "Equations"),
    ("不等式", "Inequalities"),
    ("確率", "Probability"),
    ("数A", "Math A"),
    ("数Ⅰ", "Math I"),
    ("数Ⅱ", "Math II"),
    ("数B", "Math B"),
    ("数C", "Math C"),
    ("数①", "Math ①"),
    ("数②", "Math ②"),
    ("数S", "Math S"),
    ("EEC", "EEC"),
    ("IEC", "IEC"),
    ("EECI", "EEC I"),
    ("EECII", "EEC II"),
    ("EECIII", "EEC III"),
    ("IECI", "IEC I"),
    ("IECII", "IEC II"),
    ("IECIII", "IEC III"),
    ("1年", "Grade 1"),
    ("2年", "Grade 2"),
    ("3年", "Grade 3"),
    ("兼", "&"),
    ("vintage", "Vintage"),
    ("vocabulary", "Vocabulary"),
    ("test", "Test"),
    ("PostTest", "Post Test"),
    ("PreTest", "Pre Test"),
];

/// Character-count ordering, longest first; ties keep their table order.
fn ordered_terms() -> &'static [(&'static str, &'static str)] {
    static ORDERED: OnceLock<Vec<(&'static str, &'static str)>> = OnceLock::new();
    ORDERED.get_or_init(|| {
        let mut terms = TERMS.to_vec();
        terms.sort_by_key(|(pattern, _)| std::cmp::Reverse(pattern.chars().count()));
        terms
    })
}

struct Cleanup {
    underscore: Regex,
    letter_digit: Regex,
    digit_letter: Regex,
    ordinal: Regex,
    semester: Regex,
    whitespace: Regex,
}

fn cleanup() -> &'static Cleanup {
    static CLEANUP: OnceLock<Cleanup> = OnceLock::new();
    CLEANUP.get_or_init(|| Cleanup {
        underscore: Regex::new(r"[_\u{3000}]").expect("valid regex"),
        letter_digit: Regex::new(r"([a-zA-Z])([0-9])").expect("valid regex"),
        digit_letter: Regex::new(r"([0-9])([a-zA-Z])").expect("valid regex"),
        ordinal: Regex::new(r"([0-9]) (st|nd|rd|th)\b").expect("valid regex"),
        semester: Regex::new(r"(Semester)(Midterm|Final)").expect("valid regex"),
        whitespace: Regex::new(r"\s+").expect("valid regex"),
    })
}

pub fn translate_line(line: &str) -> String {
    let line = line.trim();
    if line.is_empty() {
        return String::new();
    }

    let mut translated = line.to_string();
    for (pattern, replacement) in ordered_terms() {
        if translated.contains(pattern) {
            translated = translated.replace(pattern, replacement);
        }
    }

    let rules = cleanup();
    let translated = rules.underscore.replace_all(&translated, " ");
    let translated = rules.letter_digit.replace_all(&translated, "$1 $2");
    let translated = rules.digit_letter.replace_all(&translated, "$1 $2");
    let translated = rules.ordinal.replace_all(&translated, "$1$2");
    let translated = rules.semester.replace_all(&translated, "$1 $2");
    let translated = rules.whitespace.replace_all(&translated, " ");
    translated.trim().to_string()
}

/// `original\ttranslated` for every non-empty line; blank lines stay blank.
pub fn bilingual_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            let original = line.trim();
            if original.is_empty() {
                String::new()
            } else {
                format!("{original}\t{}", translate_line(original))
            }
        })
        .collect()
}

/// Translates `input` into `output`, returning the number of translated lines.
pub fn translate_file(input: &Path, output: &Path) -> anyhow::Result<usize> {
    let text = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let lines = bilingual_lines(&text);

    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(output, contents).with_context(|| format!("failed to write {}", output.display()))?;

    Ok(lines.iter().filter(|line| !line.is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longer_terms_win_over_their_parts() {
        assert_eq!(translate_line("連立方程式"), "Simultaneous Equations");
        assert_eq!(translate_line("ベネッセ模試"), "Benesse Mock Test");
        assert_eq!(translate_line("文標準1"), "Liberal Arts Standard 1");
    }

    #[test]
    fn equal_length_terms_keep_table_order() {
        let terms = ordered_terms();
        let position = |p: &str| terms.iter().position(|(t, _)| *t == p).unwrap();
        assert!(position("内進") < position("外進"));
        assert!(position("EECIII") < position("IECIII"));
        assert!(position("夏休み明けテスト") < position("図形の性質と証明"));
        assert_eq!(terms[0].0, "vocabulary");
    }

    #[test]
    fn cleanup_spaces_tokens() {
        assert_eq!(translate_line("前期中間_数学"), "First Semester Midterm Mathematics");
        assert_eq!(translate_line("中学 1年　第1回"), "Middle School Grade 1 1st Round");
        assert_eq!(translate_line("Unit3test"), "Unit 3 Test");
        assert_eq!(translate_line("  "), "");
    }

    #[test]
    fn file_mode_keeps_blank_lines() {
        let lines = bilingual_lines("数学\n\n英語 確率\n");
        assert_eq!(
            lines,
            vec![
                "数学\tMathematics".to_string(),
                String::new(),
                "英語 確率\tEnglish Probability".to_string(),
            ]
        );
    }

    #[test]
    fn writes_translated_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tests.txt");
        let output = dir.path().join("tests_bilingual.txt");
        fs::write(&input, "期末\n\n平方根\n").unwrap();

        let count = translate_file(&input, &output).unwrap();
        assert_eq!(count, 2);
        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(written, "期末\tFinal\n\n平方根\tSquare Roots\n");
    }
}
