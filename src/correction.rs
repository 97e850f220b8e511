use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Translation3, Vector3};

/// Length below which a direction is treated as degenerate.
pub const AXIS_EPSILON: f32 = 1e-8;

/// Axis a stance rotation is applied about, in PMX space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointAxis {
    Y,
    Z,
}

/// Build the homogeneous rotation applied at a stance joint.
///
/// # Arguments
///
/// * `axis` - Rotation axis.
/// * `degrees` - Signed angle in degrees.
///
/// # Returns
///
/// 4x4 rotation matrix without translation.
pub fn joint_rotation(axis: JointAxis, degrees: f32) -> Matrix4<f32> {
    let axis = match axis {
        JointAxis::Y => Vector3::y_axis(),
        JointAxis::Z => Vector3::z_axis(),
    };
    Rotation3::from_axis_angle(&axis, degrees.to_radians()).to_homogeneous()
}

/// Advance a chain matrix by one bone.
///
/// # Arguments
///
/// * `parent` - Accumulated matrix of the parent bone.
/// * `relative` - Rest offset from the parent bone to this bone.
/// * `rotation` - Optional joint rotation applied at this bone.
///
/// # Returns
///
/// Matrix that maps this bone's local rest frame to the posed frame.
pub fn chain_step(
    parent: &Matrix4<f32>,
    relative: Vector3<f32>,
    rotation: Option<&Matrix4<f32>>,
) -> Matrix4<f32> {
    let moved = parent * Translation3::from(relative).to_homogeneous();
    match rotation {
        Some(rotation) => moved * rotation,
        None => moved,
    }
}

/// Posed position of a bone origin.
pub fn posed_origin(matrix: &Matrix4<f32>) -> Vector3<f32> {
    matrix.transform_point(&Point3::origin()).coords
}

/// Derive PMX local axes for a bone whose X axis points along `x_dir`.
///
/// Z is `X × (−Y)`, falling back to `X × Z` when X is parallel to Y.
///
/// # Returns
///
/// `Some((x, z))` as unit vectors, or `None` when `x_dir` is degenerate.
pub fn local_axes(x_dir: Vector3<f32>) -> Option<(Vector3<f32>, Vector3<f32>)> {
    let x = x_dir.try_normalize(AXIS_EPSILON)?;
    let z = x
        .cross(&-Vector3::y())
        .try_normalize(AXIS_EPSILON)
        .or_else(|| x.cross(&Vector3::z()).try_normalize(AXIS_EPSILON))?;
    Some((x, z))
}

/// One weighted bone influence on a vertex during reprojection.
#[derive(Debug, Clone, Copy)]
pub struct Influence<'a> {
    pub matrix: &'a Matrix4<f32>,
    /// Rest position of the bone before the stance change.
    pub origin: Vector3<f32>,
    pub weight: f32,
}

/// Reproject a rest vertex through weighted bone matrices.
///
/// # Arguments
///
/// * `influences` - Bone matrices with rest origins and weights.
/// * `position` - Rest position.
/// * `normal` - Rest normal.
///
/// # Returns
///
/// `(position, normal)` in the new stance. The normal is renormalized when
/// its blended length exceeds [`AXIS_EPSILON`], otherwise left as blended.
pub fn reproject_vertex(
    influences: &[Influence<'_>],
    position: Vector3<f32>,
    normal: Vector3<f32>,
) -> (Vector3<f32>, Vector3<f32>) {
    if let [single] = influences {
        let rotation: Matrix3<f32> = single.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let moved = single
            .matrix
            .transform_point(&Point3::from(position - single.origin))
            .coords;
        let turned = rotation * normal;
        return (moved, renormalize(turned));
    }

    let mut moved = Vector3::zeros();
    let mut turned = Vector3::zeros();
    for influence in influences {
        let rotation: Matrix3<f32> = influence.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        moved += influence
            .matrix
            .transform_point(&Point3::from(position - influence.origin))
            .coords
            * influence.weight;
        turned += rotation * normal * influence.weight;
    }
    (moved, renormalize(turned))
}

fn renormalize(normal: Vector3<f32>) -> Vector3<f32> {
    normal.try_normalize(AXIS_EPSILON).unwrap_or(normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vector3<f32>, b: Vector3<f32>) -> bool {
        (a - b).norm() < 1e-4
    }

    #[test]
    fn given_z_roll_when_stepping_chain_then_child_swings_down() {
        let shoulder = chain_step(&Matrix4::identity(), Vector3::new(1.0, 0.0, 0.0), None);
        let arm = chain_step(
            &shoulder,
            Vector3::new(1.0, 0.0, 0.0),
            Some(&joint_rotation(JointAxis::Z, -90.0)),
        );
        let elbow = chain_step(&arm, Vector3::new(2.0, 0.0, 0.0), None);

        assert!(approx(posed_origin(&arm), Vector3::new(2.0, 0.0, 0.0)));
        assert!(approx(posed_origin(&elbow), Vector3::new(2.0, -2.0, 0.0)));
    }

    #[test]
    fn given_horizontal_direction_when_deriving_axes_then_z_is_perpendicular() {
        let (x, z) = local_axes(Vector3::new(3.0, 0.0, 0.0)).unwrap();

        assert!(approx(x, Vector3::x()));
        assert!(x.dot(&z).abs() < 1e-6);
        assert!(approx(z, Vector3::new(0.0, 0.0, -1.0)));
    }

    #[test]
    fn given_vertical_direction_when_deriving_axes_then_fallback_axis_is_used() {
        let (_, z) = local_axes(Vector3::new(0.0, 2.0, 0.0)).unwrap();
        assert!(approx(z, Vector3::new(1.0, 0.0, 0.0)));
        assert!(local_axes(Vector3::zeros()).is_none());
    }

    #[test]
    fn given_half_weights_when_reprojecting_then_position_blends_between_bones() {
        let still = Translation3::new(0.0, 0.0, 0.0).to_homogeneous();
        let lifted = Translation3::new(0.0, 2.0, 0.0).to_homogeneous();
        let influences = [
            Influence { matrix: &still, origin: Vector3::zeros(), weight: 0.5 },
            Influence { matrix: &lifted, origin: Vector3::zeros(), weight: 0.5 },
        ];

        let (position, normal) =
            reproject_vertex(&influences, Vector3::new(1.0, 0.0, 0.0), Vector3::z());

        assert!(approx(position, Vector3::new(1.0, 1.0, 0.0)));
        assert!(approx(normal, Vector3::z()));
    }
}
