use glam::{Mat3, Vec3};

/// Rotation taking the direction of `x` onto the direction of `y`;
/// identity when they are (anti)parallel.
fn rotation_onto(x: Vec3, y: Vec3) -> Mat3 {
    let z = x.normalize_or_zero();
    let w = y.normalize_or_zero();
    let axis = z.cross(w);
    if axis.length() < 1e-4 {
        return Mat3::IDENTITY;
    }
    let angle = z.dot(w).clamp(-1.0, 1.0).acos();
    Mat3::from_axis_angle(axis.normalize(), angle)
}

/// The affine bringing an oriented slice into the reconstruction frame.
///
/// Scales the slice plane by the volume half-extent `k`, translates its
/// center to the origin, and rotates the first slice axis onto `+x`, then
/// the second onto `+y`.
///
/// Returns `(delta, rot, scale)`: translate by `delta`, rotate by `rot`,
/// scale component-wise by `scale`.
pub fn slice_transform(base: Vec3, axis_1: Vec3, axis_2: Vec3, k: f32) -> (Vec3, Mat3, Vec3) {
    let base = base * k;
    let axis_1 = axis_1 * k;
    let axis_2 = axis_2 * k;
    let delta = base + 0.5 * (axis_1 + axis_2);

    let rot = rotation_onto(axis_1, Vec3::new(2.0 * k, 0.0, 0.0));
    let rot = rotation_onto(rot * axis_2, Vec3::new(0.0, 2.0 * k, 0.0)) * rot;

    (-delta, rot, Vec3::ONE)
}
