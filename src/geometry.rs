//! Boundary outline parsing and simplification.
//!
//! Provider outlines arrive as SVG path data (`M x y L x y x y ... Z`). They are
//! parsed into an ordered list of straight segments, reduced, and written back
//! out in the same path syntax for storage and rendering.


use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::errors::{AppError, AppResult};

const DEFAULT_PRECISION: u32 = 1;
const DEFAULT_SAMPLE_SEED: u64 = 0x5eed;
const SAMPLED_SUBPATHS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn quantized(self, factor: f64) -> Self {
        Self {
            x: quantize(self.x, factor),
            y: quantize(self.y, factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outline {
    segments: Vec<Segment>,
}

impl Outline {
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn parse_svg(path: &str) -> AppResult<Self> {
        let mut tokens = path
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty());
        let mut segments = Vec::new();
        let mut cursor: Option<Point> = None;
        let mut subpath_start: Option<Point> = None;
        let mut drawing = false;

        while let Some(token) = tokens.next() {
            match token {
                "M" => {
                    let x = next_number(&mut tokens, "M")?;
                    let y = next_number(&mut tokens, "M")?;
                    let point = Point::new(x, y);
                    cursor = Some(point);
                    subpath_start = Some(point);
                    // coordinate pairs following a move are implicit line-tos
                    drawing = true;
                }
                "L" => {
                    if cursor.is_none() {
                        return Err(AppError::Geometry("line-to before any move-to".into()));
                    }
                    drawing = true;
                }
                "Z" | "z" => {
                    let (Some(current), Some(start)) = (cursor, subpath_start) else {
                        return Err(AppError::Geometry("close-path before any move-to".into()));
                    };
                    if current != start {
                        segments.push(Segment::new(current, start));
                    }
                    cursor = Some(start);
                    drawing = false;
                }
                value => {
                    let start = match cursor {
                        Some(point) if drawing => point,
                        _ => {
                            return Err(AppError::Geometry(format!(
                                "unexpected token `{value}`"
                            )))
                        }
                    };
                    let x = parse_number(value)?;
                    let y = next_number(&mut tokens, "L")?;
                    let end = Point::new(x, y);
                    segments.push(Segment::new(start, end));
                    cursor = Some(end);
                }
            }
        }

        Ok(Self { segments })
    }

    pub fn to_svg(&self) -> String {
        let mut out = String::new();
        for chain in self.chains() {
            let closed = chain.len() > 2 && chain.first() == chain.last();
            let body = if closed {
                &chain[..chain.len() - 1]
            } else {
                &chain[..]
            };
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!(
                "M {} {} L",
                format_coord(body[0].x),
                format_coord(body[0].y)
            ));
            for point in &body[1..] {
                out.push_str(&format!(" {} {}", format_coord(point.x), format_coord(point.y)));
            }
            if closed {
                out.push_str(" Z");
            }
        }
        out
    }

    /// Runs of connected segments, each as its vertex list.
    fn chains(&self) -> Vec<Vec<Point>> {
        let mut chains: Vec<Vec<Point>> = Vec::new();
        for segment in &self.segments {
            match chains.last_mut() {
                Some(chain) if chain.last() == Some(&segment.start) => chain.push(segment.end),
                _ => chains.push(vec![segment.start, segment.end]),
            }
        }
        chains
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimplifyStrategy {
    /// Snap vertices to a decimal grid and drop segments that collapse.
    Quantize { precision: u32 },
    /// Keep the longest subpaths and a seeded sample of their vertices.
    Sample { limit: usize, seed: u64 },
}

impl Default for SimplifyStrategy {
    fn default() -> Self {
        SimplifyStrategy::Quantize {
            precision: DEFAULT_PRECISION,
        }
    }
}

impl SimplifyStrategy {
    pub fn parse(value: &str, sample_limit: usize) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quantize" => Some(Self::default()),
            "sample" => Some(SimplifyStrategy::Sample {
                limit: sample_limit.max(1),
                seed: DEFAULT_SAMPLE_SEED,
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimplifyStrategy::Quantize { .. } => "quantize",
            SimplifyStrategy::Sample { .. } => "sample",
        }
    }

    pub fn simplify(&self, outline: &Outline) -> Outline {
        match *self {
            SimplifyStrategy::Quantize { precision } => quantize_outline(outline, precision),
            SimplifyStrategy::Sample { limit, seed } => sample_outline(outline, limit, seed),
        }
    }

    /// Parses, simplifies and re-serializes a provider path. An empty string
    /// means nothing usable survived.
    pub fn simplify_svg(&self, path: &str) -> AppResult<String> {
        let outline = Outline::parse_svg(path)?;
        Ok(self.simplify(&outline).to_svg())
    }
}

fn quantize_outline(outline: &Outline, precision: u32) -> Outline {
    let factor = 10_f64.powi(precision as i32);
    let segments = outline
        .segments
        .iter()
        .map(|segment| Segment::new(segment.start.quantized(factor), segment.end.quantized(factor)))
        .filter(|segment| !segment.is_degenerate())
        .collect();
    Outline::from_segments(segments)
}

fn sample_outline(outline: &Outline, limit: usize, seed: u64) -> Outline {
    let chains = outline.chains();
    let mut by_length: Vec<usize> = (0..chains.len()).collect();
    by_length.sort_by(|a, b| chains[*b].len().cmp(&chains[*a].len()));
    let mut kept: Vec<usize> = by_length.into_iter().take(SAMPLED_SUBPATHS).collect();
    kept.sort_unstable();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut segments = Vec::new();
    for index in kept {
        let chain = &chains[index];
        let closed = chain.len() > 2 && chain.first() == chain.last();
        let open_len = if closed { chain.len() - 1 } else { chain.len() };
        let rest = open_len - 1;

        let mut picked: Vec<usize> = if rest > limit {
            rand::seq::index::sample(&mut rng, rest, limit).into_vec()
        } else {
            (0..rest).collect()
        };
        picked.sort_unstable();

        let mut points = Vec::with_capacity(picked.len() + 2);
        points.push(chain[0]);
        points.extend(picked.into_iter().map(|i| chain[i + 1]));
        if closed {
            points.push(chain[0]);
        }
        segments.extend(
            points
                .windows(2)
                .map(|pair| Segment::new(pair[0], pair[1]))
                .filter(|segment| !segment.is_degenerate()),
        );
    }
    Outline::from_segments(segments)
}

fn quantize(value: f64, factor: f64) -> f64 {
    // adding zero folds -0.0 into 0.0 so equal points compare equal
    (value * factor).round() / factor + 0.0
}

fn format_coord(value: f64) -> String {
    format!("{}", value + 0.0)
}

fn next_number<'a>(tokens: &mut impl Iterator<Item = &'a str>, command: &str) -> AppResult<f64> {
    let token = tokens
        .next()
        .ok_or_else(|| AppError::Geometry(format!("`{command}` is missing a coordinate")))?;
    parse_number(token)
}

fn parse_number(token: &str) -> AppResult<f64> {
    token
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| AppError::Geometry(format!("`{token}` is not a coordinate")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantizer() -> SimplifyStrategy {
        SimplifyStrategy::default()
    }

    #[test]
    fn parses_move_line_and_close() {
        let outline = Outline::parse_svg("M 0 0 L 1 0 1 1 Z").unwrap();
        assert_eq!(
            outline.segments(),
            &[
                Segment::new(Point::new(0.0, 0.0), Point::new(1.0, 0.0)),
                Segment::new(Point::new(1.0, 0.0), Point::new(1.0, 1.0)),
                Segment::new(Point::new(1.0, 1.0), Point::new(0.0, 0.0)),
            ]
        );
        assert_eq!(outline.to_svg(), "M 0 0 L 1 0 1 1 Z");
    }

    #[test]
    fn keeps_separate_subpaths_apart() {
        let outline = Outline::parse_svg("M 0 0 L 2 0 2 2 Z M 5 5 L 6 5 6 6 Z").unwrap();
        assert_eq!(outline.len(), 6);
        assert_eq!(outline.to_svg(), "M 0 0 L 2 0 2 2 Z M 5 5 L 6 5 6 6 Z");
    }

    #[test]
    fn collapses_segments_that_round_to_one_point() {
        let outline = Outline::parse_svg("M 0 0 L 5.01 5.02 5.04 4.98").unwrap();
        assert_eq!(outline.len(), 2);

        let simplified = quantizer().simplify(&outline);
        assert_eq!(
            simplified.segments(),
            &[Segment::new(Point::new(0.0, 0.0), Point::new(5.0, 5.0))]
        );
    }

    #[test]
    fn preserves_segment_order_after_quantizing() {
        let simplified = quantizer()
            .simplify_svg("M 10.04 20.01 L 10.51 20.02 10.52 20.03 10.49 20.66 Z")
            .unwrap();
        assert_eq!(simplified, "M 10 20 L 10.5 20 10.5 20.7 Z");
    }

    #[test]
    fn fully_collapsed_outline_is_empty_not_an_error() {
        let simplified = quantizer()
            .simplify_svg("M 1.01 1.01 L 1.02 1.03 0.99 1.04 Z")
            .unwrap();
        assert!(simplified.is_empty());
    }

    #[test]
    fn negative_zero_does_not_split_points() {
        let simplified = quantizer()
            .simplify_svg("M -0.01 0 L 0.01 0 3 3")
            .unwrap();
        assert_eq!(simplified, "M 0 0 L 3 3");
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["M 1", "L 1 2", "M 1 2 L 3", "M 1 2 Q 3 4", "M a b", "Z", "3 4"] {
            let err = Outline::parse_svg(path).unwrap_err();
            assert!(matches!(err, AppError::Geometry(_)), "{path}: {err:?}");
        }
    }

    #[test]
    fn sampling_is_bounded_and_repeatable() {
        let mut path = String::from("M 0 0 L");
        for i in 1..400 {
            path.push_str(&format!(" {i} {}", i % 7));
        }
        path.push_str(" Z M 900 900 L 901 900 901 901 Z");
        path.push_str(" M 800 800 L 801 800 801 801 802 802 Z");
        path.push_str(" M 700 700 L 701 700 Z");
        let strategy = SimplifyStrategy::Sample { limit: 20, seed: 7 };

        let first = strategy.simplify_svg(&path).unwrap();
        let second = strategy.simplify_svg(&path).unwrap();
        assert_eq!(first, second);

        let outline = Outline::parse_svg(&first).unwrap();
        // 21 segments for the sampled ring plus the two small rings kept intact
        assert_eq!(outline.len(), 21 + 4 + 3);
        assert!(!first.contains("700 700"));
    }
}
