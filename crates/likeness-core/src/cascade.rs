//! Haar cascade detector reading OpenCV's `opencv-cascade-classifier` XML.
//!
//! Detection scans a fixed-size window over an image pyramid. Each window is
//! variance-normalized over its inner area (one-pixel border excluded), then
//! pushed through boosted stages of decision trees; it is rejected as soon as a
//! stage sum falls below that stage's threshold. Surviving windows are merged
//! by neighbour grouping.

use crate::cropper::ObjectDetector;
use crate::imaging;
use crate::types::Rect;
use image::GrayImage;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Relative tolerance used when grouping neighbouring detections.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("cannot read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cascade XML parse error: {0}")]
    Xml(String),
    #[error("cascade is missing <{0}>")]
    MissingElement(&'static str),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step between scales; must be greater than 1.
    pub scale_factor: f64,
    /// Minimum raw hits a group needs to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest reported object side in pixels (0 = cascade window).
    pub min_size: u32,
    /// Largest reported object side in pixels (0 = image size).
    pub max_size: u32,
}

impl DetectorParams {
    /// Parameters used for whole-face detection.
    pub fn face() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            ..Self::default()
        }
    }

    /// Parameters used for eye detection inside a face crop.
    pub fn eyes() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if !(self.scale_factor > 1.0 && self.scale_factor.is_finite()) {
            return Err(CascadeError::InvalidParams(format!(
                "scale_factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        if self.max_size != 0 && self.max_size < self.min_size {
            return Err(CascadeError::InvalidParams(format!(
                "max_size {} is below min_size {}",
                self.max_size, self.min_size
            )));
        }
        Ok(())
    }
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: 0,
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn value(&self, integral: &IntegralImage, ox: u32, oy: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * integral.sum(ox + r.x, oy + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Internal split node. Child values `<= 0` are leaves (`-value` indexes the
/// leaf table); positive values index later nodes.
#[derive(Debug, Clone)]
struct TreeNode {
    feature: usize,
    threshold: f64,
    left: i32,
    right: i32,
}

#[derive(Debug, Clone)]
struct DecisionTree {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

impl DecisionTree {
    fn evaluate(&self, mut feature_value: impl FnMut(usize) -> f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            let next = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<DecisionTree>,
}

/// A boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade definition from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let document = parse_document(xml)?;
        let storage = document.require("opencv_storage")?;
        let root = storage.child("cascade").ok_or_else(|| {
            CascadeError::Unsupported(
                "no <cascade> element; only the opencv-cascade-classifier layout is read".into(),
            )
        })?;

        let stage_type = root.require("stageType")?.text.as_str();
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = root.require("featureType")?.text.as_str();
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = root.require("width")?.scalar("width")?;
        let window_height: u32 = root.require("height")?.scalar("height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = root
            .require("features")?
            .items()
            .map(|node| parse_feature(node, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = root
            .require("stages")?
            .items()
            .map(|node| parse_stage(node, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        let mut referenced = vec![false; features.len()];
        for node in stages.iter().flat_map(|s| &s.trees).flat_map(|t| &t.nodes) {
            referenced[node.feature] = true;
        }
        let unused = referenced.iter().filter(|&&r| !r).count();
        if unused > 0 {
            tracing::warn!(unused, total = features.len(), "cascade defines unreferenced features");
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Training window size (width, height).
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Does the window with top-left corner (x, y) pass every stage?
    fn accepts(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let area = ((self.window_width - 2) * (self.window_height - 2)) as f64;
        let sum = integral.sum(x + 1, y + 1, self.window_width - 2, self.window_height - 2) as f64;
        let sq_sum =
            integral.sq_sum(x + 1, y + 1, self.window_width - 2, self.window_height - 2) as f64;
        let norm = area * sq_sum - sum * sum;
        let norm = if norm > 0.0 { norm.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let total: f64 = stage
                .trees
                .iter()
                .map(|tree| tree.evaluate(|f| self.features[f].value(integral, x, y) / norm))
                .sum();
            if total < stage.threshold {
                return false;
            }
        }
        true
    }

    /// Raw window hits over the image pyramid, in source-image coordinates.
    fn scan(&self, image: &GrayImage, params: &DetectorParams) -> Vec<Rect> {
        let (img_w, img_h) = image.dimensions();
        let (max_w, max_h) = if params.max_size == 0 {
            (img_w, img_h)
        } else {
            (params.max_size, params.max_size)
        };

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w <= self.window_width || scaled_h <= self.window_height {
                break;
            }
            let object_w = (self.window_width as f64 * factor).round() as u32;
            let object_h = (self.window_height as f64 * factor).round() as u32;
            if object_w > max_w || object_h > max_h {
                break;
            }
            if object_w < params.min_size || object_h < params.min_size {
                factor *= params.scale_factor;
                continue;
            }

            let scaled = if scaled_w == img_w && scaled_h == img_h {
                image.clone()
            } else {
                imaging::resize_bilinear(image, scaled_w, scaled_h)
            };
            let integral = IntegralImage::new(&scaled);
            let step = if factor > 2.0 { 1 } else { 2 };

            for y in (0..scaled_h - self.window_height).step_by(step) {
                for x in (0..scaled_w - self.window_width).step_by(step) {
                    if self.accepts(&integral, x, y) {
                        hits.push(Rect::new(
                            (x as f64 * factor).round() as u32,
                            (y as f64 * factor).round() as u32,
                            object_w,
                            object_h,
                        ));
                    }
                }
            }

            factor *= params.scale_factor;
        }

        hits
    }

    /// Detect objects, merging raw hits into groups of at least
    /// `params.min_neighbors + 1` neighbours.
    pub fn detect_multi_scale(&self, image: &GrayImage, params: &DetectorParams) -> Vec<Rect> {
        let hits = self.scan(image, params);
        let raw = hits.len();
        let grouped = group_rectangles(hits, params.min_neighbors, GROUP_EPS);
        tracing::trace!(raw, grouped = grouped.len(), "cascade scan finished");
        grouped
    }
}

/// A cascade bound to its scan parameters.
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, CascadeError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    pub fn load(path: &Path, params: DetectorParams) -> Result<Self, CascadeError> {
        Self::new(HaarCascade::load(path)?, params)
    }
}

impl ObjectDetector for CascadeDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Rect> {
        self.cascade.detect_multi_scale(image, &self.params)
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = image.dimensions();
        let (w, h) = (w as usize, h as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self {
            stride,
            sum,
            sq_sum,
        }
    }

    fn corners(&self, table: &[u64], x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let s = self.stride;
        (table[y1 * s + x1] + table[y0 * s + x0]) - (table[y0 * s + x1] + table[y1 * s + x0])
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        self.corners(&self.sum, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        self.corners(&self.sq_sum, x, y, w, h)
    }
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar rectangles, average each cluster, drop clusters with
/// `min_neighbors` or fewer members and clusters nested inside a stronger one.
///
/// With `min_neighbors == 0` the input is returned unchanged.
pub fn group_rectangles(rects: Vec<Rect>, min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Cluster ids in order of first appearance.
    let mut cluster_of_root = vec![usize::MAX; n];
    let mut totals: Vec<[u64; 4]> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if cluster_of_root[root] == usize::MAX {
            cluster_of_root[root] = totals.len();
            totals.push([0; 4]);
            counts.push(0);
        }
        let c = cluster_of_root[root];
        totals[c][0] += r.x as u64;
        totals[c][1] += r.y as u64;
        totals[c][2] += r.width as u64;
        totals[c][3] += r.height as u64;
        counts[c] += 1;
    }

    let averaged: Vec<Rect> = totals
        .iter()
        .zip(&counts)
        .map(|(t, &count)| {
            let avg = |v: u64| (v as f64 / count as f64).round() as u32;
            Rect::new(avg(t[0]), avg(t[1]), avg(t[2]), avg(t[3]))
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            grouped.push(*r1);
        }
    }

    grouped
}

// --- XML handling ---

/// Minimal element tree; enough for OpenCV's storage layout.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(start: &BytesStart) -> Self {
        Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &'static str) -> Result<&XmlNode, CascadeError> {
        self.child(name).ok_or(CascadeError::MissingElement(name))
    }

    /// Sequence entries (`<_>` children).
    fn items(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter(|c| c.name == "_")
    }

    fn scalar<T: FromStr>(&self, what: &str) -> Result<T, CascadeError> {
        self.text
            .trim()
            .parse()
            .map_err(|_| CascadeError::Invalid(format!("bad {what} value '{}'", self.text)))
    }

    fn tokens(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace()
    }
}

fn parse_document(xml: &str) -> Result<XmlNode, CascadeError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![XmlNode::default()];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(XmlNode::new(e)),
            Ok(Event::Empty(ref e)) => {
                let node = XmlNode::new(e);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| CascadeError::Xml(e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    if !node.text.is_empty() {
                        node.text.push(' ');
                    }
                    node.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| CascadeError::Xml("unbalanced end tag".into()))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| CascadeError::Xml("unbalanced end tag".into()))?;
                parent.children.push(node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CascadeError::Xml(e.to_string())),
        }
        buf.clear();
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(document), true) => Ok(document),
        _ => Err(CascadeError::Xml("unexpected EOF inside element".into())),
    }
}

fn parse_feature(node: &XmlNode, window_w: u32, window_h: u32) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.child("tilted") {
        if tilted.text.trim() != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = node
        .require("rects")?
        .items()
        .map(|item| {
            let values: Vec<&str> = item.tokens().collect();
            let &[x, y, w, h, weight] = values.as_slice() else {
                return Err(CascadeError::Invalid(format!(
                    "feature rect needs 5 values, got '{}'",
                    item.text
                )));
            };
            let int = |s: &str| {
                s.parse::<u32>()
                    .map_err(|_| CascadeError::Invalid(format!("bad rect coordinate '{s}'")))
            };
            let rect = WeightedRect {
                x: int(x)?,
                y: int(y)?,
                width: int(w)?,
                height: int(h)?,
                weight: weight
                    .parse()
                    .map_err(|_| CascadeError::Invalid(format!("bad rect weight '{weight}'")))?,
            };
            if rect.x + rect.width > window_w || rect.y + rect.height > window_h {
                return Err(CascadeError::Invalid(format!(
                    "feature rect {} {} {} {} exceeds {window_w}x{window_h} window",
                    rect.x, rect.y, rect.width, rect.height
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(CascadeError::Invalid("feature without rects".into()));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: &XmlNode, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f64 = node.require("stageThreshold")?.scalar("stageThreshold")?;
    let trees = node
        .require("weakClassifiers")?
        .items()
        .map(|weak| parse_tree(weak, feature_count))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage { threshold, trees })
}

fn parse_tree(node: &XmlNode, feature_count: usize) -> Result<DecisionTree, CascadeError> {
    let raw: Vec<&str> = node.require("internalNodes")?.tokens().collect();
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(CascadeError::Invalid(format!(
            "internalNodes must hold groups of 4 values, got {}",
            raw.len()
        )));
    }
    let leaves = node
        .require("leafValues")?
        .tokens()
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| CascadeError::Invalid(format!("bad leaf value '{s}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let bad = |s: &str| CascadeError::Invalid(format!("bad internal node value '{s}'"));
    let nodes = raw
        .chunks(4)
        .map(|chunk| {
            Ok(TreeNode {
                left: chunk[0].parse().map_err(|_| bad(chunk[0]))?,
                right: chunk[1].parse().map_err(|_| bad(chunk[1]))?,
                feature: chunk[2].parse().map_err(|_| bad(chunk[2]))?,
                threshold: chunk[3].parse().map_err(|_| bad(chunk[3]))?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    for (idx, n) in nodes.iter().enumerate() {
        if n.feature >= feature_count {
            return Err(CascadeError::Invalid(format!(
                "node references feature {} of {feature_count}",
                n.feature
            )));
        }
        for child in [n.left, n.right] {
            let ok = if child <= 0 {
                (child.unsigned_abs() as usize) < leaves.len()
            } else {
                // Children come after their parent, which also rules out cycles.
                (child as usize) > idx && (child as usize) < nodes.len()
            };
            if !ok {
                return Err(CascadeError::Invalid(format!("node {idx} has dangling child {child}")));
            }
        }
    }

    Ok(DecisionTree { nodes, leaves })
}
