//! Screen geometry: points, bounds rectangles and swipe directions.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pixel coordinate on the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in screen pixels, `[left,top][right,bottom]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Parses a hierarchy `bounds` attribute such as `[0,0][1080,100]`.
    ///
    /// Anything that does not yield exactly four integers is the empty rect.
    pub fn parse_bounds(bounds: &str) -> Self {
        let nums: Vec<i32> = digits_re()
            .find_iter(bounds)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        match nums.as_slice() {
            [l, t, r, b] => Self::new(*l, *t, *r, *b),
            _ => Self::default(),
        }
    }

    /// Reads a `{"left","top","right","bottom"}` object as returned by `objInfo`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let field = |k: &str| value.get(k)?.as_i64().map(|v| v as i32);
        Some(Self::new(field("left")?, field("top")?, field("right")?, field("bottom")?))
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Point at a fraction of the width and height from the top-left corner.
    pub fn offset(&self, px: f64, py: f64) -> Point {
        Point::new(
            self.left + (self.width() as f64 * px) as i32,
            self.top + (self.height() as f64 * py) as i32,
        )
    }

    pub fn center(&self) -> Point {
        self.offset(0.5, 0.5)
    }

    /// Overlap of two rectangles. Empty overlaps have `left >= right` or `top >= bottom`.
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }

    /// Distance from `self` to `other` when `other` lies to the right and overlaps vertically.
    pub fn distance_right(&self, other: &Rect) -> Option<i32> {
        let i = self.intersect(other);
        (i.top < i.bottom).then(|| other.left - self.right)
    }

    pub fn distance_left(&self, other: &Rect) -> Option<i32> {
        let i = self.intersect(other);
        (i.top < i.bottom).then(|| self.left - other.right)
    }

    pub fn distance_up(&self, other: &Rect) -> Option<i32> {
        let i = self.intersect(other);
        (i.left < i.right).then(|| self.top - other.bottom)
    }

    pub fn distance_down(&self, other: &Rect) -> Option<i32> {
        let i = self.intersect(other);
        (i.left < i.right).then(|| other.top - self.bottom)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// Swipe or scroll direction.
///
/// `forward`/`backward` are vertical scroll aliases for `up`/`down`;
/// `horiz_forward`/`horiz_backward` map to `left`/`right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const FORWARD: Direction = Direction::Up;
    pub const BACKWARD: Direction = Direction::Down;
    pub const HORIZ_FORWARD: Direction = Direction::Left;
    pub const HORIZ_BACKWARD: Direction = Direction::Right;

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction: {0}")]
pub struct ParseDirectionError(pub String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" | "forward" => Ok(Direction::Up),
            "down" | "backward" => Ok(Direction::Down),
            "left" | "horiz_forward" => Ok(Direction::Left),
            "right" | "horiz_backward" => Ok(Direction::Right),
            other => Err(ParseDirectionError(other.to_string())),
        }
    }
}

/// Start and end points for a swipe of `scale` of the rectangle's size.
///
/// `Left` moves the finger right to left, `Up` moves it bottom to top.
pub fn swipe_points(bounds: &Rect, direction: Direction, scale: f64) -> (Point, Point) {
    let (w, h) = (bounds.width(), bounds.height());
    let h_offset = (w as f64 * (1.0 - scale)) as i32 / 2;
    let v_offset = (h as f64 * (1.0 - scale)) as i32 / 2;

    let left = Point::new(bounds.left + h_offset, bounds.top + h / 2);
    let right = Point::new(bounds.right - h_offset, bounds.top + h / 2);
    let top = Point::new(bounds.left + w / 2, bounds.top + v_offset);
    let bottom = Point::new(bounds.left + w / 2, bounds.bottom - v_offset);

    match direction {
        Direction::Left => (right, left),
        Direction::Right => (left, right),
        Direction::Up => (bottom, top),
        Direction::Down => (top, bottom),
    }
}
