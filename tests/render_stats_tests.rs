use pdfword_merge::{merge_layout, render_text, MergeConfig, MergeStats, TextFragment};

fn sample() -> Vec<TextFragment> {
    vec![
        TextFragment::new(0, 0.0, 0.0, 5.0, 10.0, "Hel"),
        TextFragment::new(0, 5.5, 0.0, 5.0, 10.0, "lo"),
        TextFragment::new(0, 14.0, 0.0, 8.0, 10.0, "world"),
        TextFragment::new(0, 0.0, 20.0, 6.0, 10.0, "next"),
        TextFragment::new(1, 0.0, 0.0, 3.0, 10.0, "p"),
        TextFragment::new(1, 3.1, 0.0, 3.0, 10.0, "2"),
    ]
}

#[test]
fn render_joins_words_lines_and_pages() {
    let pages = merge_layout(&sample(), &MergeConfig::default()).unwrap();
    assert_eq!(render_text(&pages), "Hello world\nnext\u{000C}p2");
}

#[test]
fn render_of_nothing_is_empty() {
    assert_eq!(render_text(&[]), "");
}

#[test]
fn stats_count_pages_lines_and_merges() {
    let input = sample();
    let pages = merge_layout(&input, &MergeConfig::default()).unwrap();
    let stats = MergeStats::from_layout(input.len(), &pages);
    assert_eq!(
        stats,
        MergeStats { fragments: 6, words: 4, pages: 2, lines: 3, merged_fragments: 2 }
    );
}
