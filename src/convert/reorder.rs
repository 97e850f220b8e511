//! Draw-order sort for transparent materials.
//!
//! Within every maximal run of adjacent transparent materials, pairs whose
//! sample clouds overlap get an ordering constraint from coverage, distance to
//! the body surface and transparency strength. Each run is then sorted with a
//! stable Kahn pass. Opaque materials never move.

use std::collections::{BTreeSet, HashSet};

use nalgebra::Vector3;

use crate::{
    error::ConvertResult,
    pmx::PmxModel,
    texture::{OPAQUE_ALPHA, TextureAlphaCache},
};

const BODY_WEIGHT_THRESHOLD: f32 = 0.35;
const MAX_BODY_POINTS: usize = 3072;
const MAX_MATERIAL_SAMPLES: usize = 192;
const MIN_SAMPLES: usize = 4;

// ─── Material facts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transparency {
    transparent: bool,
    /// `max(1 - diffuse alpha, transparent pixel ratio)`.
    score: f32,
}

fn transparency(model: &PmxModel, material: usize, alpha: &mut TextureAlphaCache) -> Transparency {
    let diffuse_alpha = model.materials[material].diffuse.w;
    let stats = model.materials[material]
        .texture_index
        .and_then(|texture| alpha.stats(texture));
    let has_clear_pixel = stats.is_some_and(|stats| stats.has_clear_pixel);
    let ratio = stats.map(|stats| stats.transparent_ratio).unwrap_or(0.0);
    Transparency {
        transparent: diffuse_alpha < OPAQUE_ALPHA || has_clear_pixel,
        score: (1.0 - diffuse_alpha).max(ratio),
    }
}

/// Distinct vertex indices referenced by each material's faces, ascending.
fn material_vertices(model: &PmxModel) -> Vec<Vec<usize>> {
    model
        .face_ranges()
        .into_iter()
        .map(|range| {
            let set: BTreeSet<usize> = model.faces[range].iter().flatten().copied().collect();
            set.into_iter().collect()
        })
        .collect()
}

/// Maximal runs of adjacent transparent materials with at least two members.
fn transparent_blocks(transparent: &[bool]) -> Vec<Vec<usize>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for (index, is_transparent) in transparent.iter().enumerate() {
        if *is_transparent {
            current.push(index);
        } else if !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks.retain(|block| block.len() >= 2);
    blocks
}

/// Evenly strided subset of at most `max` items, order preserved.
fn stride_sample<T: Copy>(items: &[T], max: usize) -> Vec<T> {
    if items.len() <= max {
        return items.to_vec();
    }
    let step = items.len().div_ceil(max);
    items.iter().step_by(step).copied().collect()
}

// ─── Body reference ───────────────────────────────────────────────────────────

fn body_weight(model: &PmxModel, vertex: usize, body_bones: &HashSet<usize>) -> f32 {
    model.vertices[vertex]
        .deform
        .bone_weights()
        .iter()
        .filter(|(bone, _)| body_bones.contains(bone))
        .map(|(_, weight)| weight)
        .sum()
}

/// Reference points on the body surface, in priority order: the opaque
/// material carrying the most body weight, else vertices bound to the body,
/// else the three largest opaque materials.
fn body_points(
    model: &PmxModel,
    vertices: &[Vec<usize>],
    transparent: &[bool],
    body_bones: &HashSet<usize>,
) -> Vec<Vector3<f32>> {
    let positions = |indices: &[usize]| -> Vec<Vector3<f32>> {
        indices.iter().map(|&v| model.vertices[v].position).collect()
    };

    let weights: Vec<f32> = (0..model.vertices.len())
        .map(|vertex| body_weight(model, vertex, body_bones))
        .collect();

    let best = (0..vertices.len())
        .filter(|&material| !transparent[material])
        .map(|material| {
            let total: f32 = vertices[material].iter().map(|&v| weights[v]).sum();
            (material, total)
        })
        .filter(|(_, total)| *total > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
    let mut points = match best {
        Some((material, _)) => positions(&vertices[material]),
        None => Vec::new(),
    };

    if points.is_empty() {
        let bound: Vec<usize> = (0..model.vertices.len())
            .filter(|&v| weights[v] >= BODY_WEIGHT_THRESHOLD)
            .collect();
        points = positions(&bound);
    }

    if points.is_empty() {
        let mut opaque: Vec<usize> = (0..vertices.len()).filter(|&m| !transparent[m]).collect();
        opaque.sort_by(|a, b| vertices[*b].len().cmp(&vertices[*a].len()).then(a.cmp(b)));
        let picked: Vec<usize> = opaque
            .into_iter()
            .take(3)
            .flat_map(|material| vertices[material].iter().copied())
            .collect();
        points = positions(&picked);
    }

    stride_sample(&points, MAX_BODY_POINTS)
}

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Vector3<f32>,
    max: Vector3<f32>,
}

impl Aabb {
    fn of(points: &[Vector3<f32>]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().fold(Self { min: first, max: first }, |aabb, p| Self {
            min: aabb.min.inf(p),
            max: aabb.max.sup(p),
        }))
    }

    fn diagonal(&self) -> f32 {
        (self.max - self.min).norm()
    }

    fn intersects(&self, other: &Self, margin: f32) -> bool {
        (0..3).all(|axis| {
            self.min[axis] - margin <= other.max[axis] && other.min[axis] - margin <= self.max[axis]
        })
    }
}

// ─── Pairwise decision ────────────────────────────────────────────────────────

/// Samples of one transparent material with their distance to the body.
#[derive(Debug, Clone)]
struct MaterialSample {
    points: Vec<Vector3<f32>>,
    body_distance: Vec<f32>,
    aabb: Option<Aabb>,
    score: f32,
}

impl MaterialSample {
    fn new(points: Vec<Vector3<f32>>, body: &[Vector3<f32>], score: f32) -> Self {
        let body_distance = points
            .iter()
            .map(|p| {
                body.iter()
                    .map(|b| (p - b).norm())
                    .fold(f32::INFINITY, f32::min)
            })
            .map(|d| if d.is_finite() { d } else { 0.0 })
            .collect();
        let aabb = Aabb::of(&points);
        Self {
            points,
            body_distance,
            aabb,
            score,
        }
    }

    /// Indices of samples within `t` of any sample of `other`.
    fn overlap_with(&self, other: &Self, t: f32) -> Vec<usize> {
        let t2 = t * t;
        (0..self.points.len())
            .filter(|&i| {
                other
                    .points
                    .iter()
                    .any(|q| (self.points[i] - q).norm_squared() <= t2)
            })
            .collect()
    }

    fn median_distance(&self, samples: &[usize]) -> f32 {
        let mut distances: Vec<f32> = samples.iter().map(|&i| self.body_distance[i]).collect();
        distances.sort_by(f32::total_cmp);
        let n = distances.len();
        if n == 0 {
            0.0
        } else if n % 2 == 1 {
            distances[n / 2]
        } else {
            (distances[n / 2 - 1] + distances[n / 2]) * 0.5
        }
    }
}

/// Measurements for one (L, R) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct PairMetrics {
    pub(super) cov_l: f32,
    pub(super) cov_r: f32,
    pub(super) s_l: f32,
    pub(super) s_r: f32,
    pub(super) alpha_l: f32,
    pub(super) alpha_r: f32,
}

fn measure(left: &MaterialSample, right: &MaterialSample, t: f32) -> Option<PairMetrics> {
    if left.points.len() < MIN_SAMPLES || right.points.len() < MIN_SAMPLES {
        return None;
    }
    let (Some(aabb_l), Some(aabb_r)) = (left.aabb, right.aabb) else {
        return None;
    };
    if !aabb_l.intersects(&aabb_r, t) {
        return None;
    }
    let overlap_l = left.overlap_with(right, t);
    let overlap_r = right.overlap_with(left, t);
    if overlap_l.is_empty() || overlap_r.is_empty() {
        return None;
    }
    Some(PairMetrics {
        cov_l: overlap_l.len() as f32 / left.points.len() as f32,
        cov_r: overlap_r.len() as f32 / right.points.len() as f32,
        s_l: left.median_distance(&overlap_l),
        s_r: right.median_distance(&overlap_r),
        alpha_l: left.score,
        alpha_r: right.score,
    })
}

/// `Some(true)` when L draws first, `Some(false)` when R does, `None` when
/// the pair is unconstrained.
pub(super) fn decide(m: &PairMetrics) -> Option<bool> {
    let min_cov = m.cov_l.min(m.cov_r);
    let gap = (m.cov_l - m.cov_r).abs();
    let ds = (m.s_l - m.s_r).abs();
    let da = m.alpha_l - m.alpha_r;

    let far_first = m.s_l >= m.s_r;
    let near_first = m.s_l <= m.s_r;
    let lower_alpha_first = m.alpha_l <= m.alpha_r;

    if min_cov < 0.05 {
        return None;
    }

    if gap >= 0.30 && min_cov < 0.50 {
        if da.abs() >= 0.005 {
            if m.alpha_l >= 0.90 && m.alpha_r >= 0.90 && da.abs() >= 0.08 {
                return Some(far_first);
            }
            let (s_low, s_high) = if lower_alpha_first {
                (m.s_l, m.s_r)
            } else {
                (m.s_r, m.s_l)
            };
            if s_low > s_high + 0.085 {
                // The high-alpha material is much nearer the body: draw it first.
                return Some(!lower_alpha_first);
            }
            return Some(lower_alpha_first);
        }
        if ds >= 0.001 {
            return Some(far_first);
        }
    }

    if min_cov < 0.10 && da.abs() >= 0.005 {
        return Some(lower_alpha_first);
    }
    if (0.20..0.50).contains(&min_cov) && gap <= 0.03 && da.abs() >= 0.06 {
        return Some(lower_alpha_first);
    }
    if da.abs() <= 1e-6 && min_cov >= 0.50 && ds >= 0.001 {
        return Some(near_first);
    }
    if ds >= 0.085 {
        return Some(far_first);
    }
    if min_cov >= 0.50 && da.abs() >= 0.005 {
        return Some(lower_alpha_first);
    }
    if ds < 0.02 {
        return Some(if min_cov >= 0.20 { far_first } else { near_first });
    }
    let rel = ds / m.s_l.abs().max(m.s_r.abs()).max(1e-6);
    Some(if rel < 0.05 { near_first } else { far_first })
}

// ─── Topological sort ─────────────────────────────────────────────────────────

/// Stable Kahn sort over `count` nodes; ties go to the lowest index. A cycle
/// is broken by forcing the remaining node with the smallest in-degree.
pub(super) fn stable_topological_order(count: usize, edges: &[(usize, usize)]) -> Vec<usize> {
    let mut successors = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];
    for &(before, after) in edges {
        if before < count && after < count && before != after {
            successors[before].push(after);
            in_degree[after] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&n| in_degree[n] == 0).collect();
    let mut emitted = vec![false; count];
    let mut order = Vec::with_capacity(count);
    while order.len() < count {
        let next = match ready.pop_first() {
            Some(next) => next,
            None => {
                let Some(forced) = (0..count)
                    .filter(|&n| !emitted[n])
                    .min_by_key(|&n| (in_degree[n], n))
                else {
                    break;
                };
                log::debug!("material order cycle broken at block position {forced}");
                forced
            }
        };
        if emitted[next] {
            continue;
        }
        emitted[next] = true;
        order.push(next);
        for &successor in &successors[next] {
            in_degree[successor] = in_degree[successor].saturating_sub(1);
            if in_degree[successor] == 0 && !emitted[successor] {
                ready.insert(successor);
            }
        }
    }
    order
}

// ─── Stage entry ──────────────────────────────────────────────────────────────

/// Reorder transparent materials in place. `body_bones` are the bone indices
/// of the humanoid trunk. Returns whether any material moved.
pub(crate) fn reorder_materials(
    model: &mut PmxModel,
    body_bones: &HashSet<usize>,
    alpha: &mut TextureAlphaCache,
) -> ConvertResult<bool> {
    let count = model.materials.len();
    let facts: Vec<Transparency> = (0..count)
        .map(|material| transparency(model, material, alpha))
        .collect();
    let transparent: Vec<bool> = facts.iter().map(|fact| fact.transparent).collect();
    let blocks = transparent_blocks(&transparent);
    if blocks.is_empty() {
        log::debug!("material reorder: no transparent runs");
        return Ok(false);
    }

    let vertices = material_vertices(model);
    let body = body_points(model, &vertices, &transparent, body_bones);
    let t = Aabb::of(&body)
        .map(|aabb| aabb.diagonal() * 0.03)
        .unwrap_or(0.0)
        .max(0.01);

    let mut order: Vec<usize> = (0..count).collect();
    for block in &blocks {
        let samples: Vec<MaterialSample> = block
            .iter()
            .map(|&material| {
                let indices = stride_sample(&vertices[material], MAX_MATERIAL_SAMPLES);
                let points = indices.iter().map(|&v| model.vertices[v].position).collect();
                MaterialSample::new(points, &body, facts[material].score)
            })
            .collect();

        let mut edges = Vec::new();
        for l in 0..block.len() {
            for r in (l + 1)..block.len() {
                let Some(metrics) = measure(&samples[l], &samples[r], t) else {
                    continue;
                };
                match decide(&metrics) {
                    Some(true) => edges.push((l, r)),
                    Some(false) => edges.push((r, l)),
                    None => {}
                }
            }
        }

        let sorted = stable_topological_order(block.len(), &edges);
        if sorted.len() != block.len() {
            log::warn!(
                "material reorder: block starting at {} could not be sorted; kept",
                block[0]
            );
            continue;
        }
        for (slot, local) in sorted.into_iter().enumerate() {
            order[block[slot]] = block[local];
        }
    }

    if order.iter().enumerate().all(|(new, old)| new == *old) {
        log::info!("material reorder: order unchanged");
        return Ok(false);
    }
    model.renumber_materials(&order)?;
    log::info!("material reorder: {} transparent runs sorted", blocks.len());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use nalgebra::{Vector2, Vector4};

    use super::*;
    use crate::pmx::{Bone, Deform, Material, Vertex};

    const HIPS: usize = 0;

    fn push_quad(model: &mut PmxModel, corners: [Vector3<f32>; 4], bone: usize) {
        let base = model.vertices.len();
        let material = model.materials.len() - 1;
        for corner in corners {
            let mut vertex = Vertex::new(corner, Vector3::y(), Vector2::zeros(), Deform::Single { bone });
            vertex.add_material(material);
            model.vertices.push(vertex);
        }
        model.faces.push([base, base + 1, base + 2]);
        model.faces.push([base, base + 2, base + 3]);
        model.materials[material].vertices_count += 6;
    }

    fn add_material(model: &mut PmxModel, name: &str, alpha: f32) {
        let mut material = Material::new(name);
        material.diffuse = Vector4::new(1.0, 1.0, 1.0, alpha);
        model.materials.push(material);
    }

    fn small_quad(x: f32) -> [Vector3<f32>; 4] {
        [
            Vector3::new(x, 149.0, -1.0),
            Vector3::new(x, 151.0, -1.0),
            Vector3::new(x, 151.0, 1.0),
            Vector3::new(x, 149.0, 1.0),
        ]
    }

    /// Body column around x = 0, then `far` (x = 8) before `near` (x = 2).
    fn layered_model() -> PmxModel {
        let mut model = PmxModel::new("m");
        model.bones.push(Bone::new("hips", Vector3::zeros())).unwrap();
        model.bones.push(Bone::new("skirt", Vector3::zeros())).unwrap();
        add_material(&mut model, "body", 1.0);
        for step in 0..6 {
            let y0 = step as f32 * 50.0;
            let y1 = y0 + 50.0;
            push_quad(
                &mut model,
                [
                    Vector3::new(-0.5, y0, 0.0),
                    Vector3::new(-0.5, y1, 0.0),
                    Vector3::new(0.5, y1, 0.0),
                    Vector3::new(0.5, y0, 0.0),
                ],
                HIPS,
            );
        }
        add_material(&mut model, "far", 0.7);
        push_quad(&mut model, small_quad(8.0), 1);
        add_material(&mut model, "near", 0.7);
        push_quad(&mut model, small_quad(2.0), 1);
        model
    }

    fn names(model: &PmxModel) -> Vec<&str> {
        model.materials.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn given_far_before_near_when_reordering_then_near_draws_first() {
        let mut model = layered_model();
        let far_vertex = model.faces[12][0];

        let moved = reorder_materials(&mut model, &HashSet::from([HIPS]), &mut TextureAlphaCache::new())
            .unwrap();

        assert!(moved);
        assert_eq!(names(&model), vec!["body", "near", "far"]);
        assert_eq!(model.vertices[far_vertex].material_indices, vec![2]);
        assert_eq!(model.faces[12][0], far_vertex + 4);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn given_sorted_model_when_reordering_again_then_order_is_stable() {
        let mut model = layered_model();
        let body = HashSet::from([HIPS]);
        reorder_materials(&mut model, &body, &mut TextureAlphaCache::new()).unwrap();
        let first = names(&model).join(",");

        let moved = reorder_materials(&mut model, &body, &mut TextureAlphaCache::new()).unwrap();

        assert!(!moved);
        assert_eq!(names(&model).join(","), first);
    }

    #[test]
    fn given_opaque_between_transparent_when_blocking_then_runs_do_not_merge() {
        assert_eq!(
            transparent_blocks(&[true, true, false, true, false, true, true, true]),
            vec![vec![0, 1], vec![5, 6, 7]]
        );
    }

    #[test]
    fn given_cycle_when_sorting_then_smallest_in_degree_is_forced() {
        assert_eq!(stable_topological_order(3, &[(0, 1), (1, 0), (2, 0)]), vec![2, 0, 1]);
        assert_eq!(stable_topological_order(3, &[]), vec![0, 1, 2]);
    }

    fn metrics(cov: (f32, f32), s: (f32, f32), alpha: (f32, f32)) -> PairMetrics {
        PairMetrics {
            cov_l: cov.0,
            cov_r: cov.1,
            s_l: s.0,
            s_r: s.1,
            alpha_l: alpha.0,
            alpha_r: alpha.1,
        }
    }

    #[test]
    fn given_pair_metrics_when_deciding_then_rules_apply_in_order() {
        // Too little overlap.
        assert_eq!(decide(&metrics((0.01, 0.9), (1.0, 2.0), (0.1, 0.2))), None);
        // Asymmetric overlap: lower alpha first.
        assert_eq!(decide(&metrics((0.2, 0.9), (1.0, 1.0), (0.5, 0.3))), Some(false));
        // Asymmetric overlap, low-alpha material far away: near high-alpha first.
        assert_eq!(decide(&metrics((0.2, 0.9), (1.0, 2.0), (0.5, 0.3))), Some(true));
        // Both strongly transparent: far first.
        assert_eq!(decide(&metrics((0.2, 0.9), (1.0, 2.0), (0.99, 0.9))), Some(false));
        // Equal alpha, strong overlap: near first.
        assert_eq!(decide(&metrics((0.8, 0.8), (3.0, 1.0), (0.3, 0.3))), Some(false));
        // Large distance gap: far first.
        assert_eq!(decide(&metrics((0.3, 0.45), (3.0, 1.0), (0.3, 0.302))), Some(true));
        // Close distances with modest overlap: far first.
        assert_eq!(decide(&metrics((0.3, 0.45), (1.01, 1.0), (0.3, 0.3))), Some(true));
    }
}
