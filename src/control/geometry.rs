// Wheel geometry for the differential base
// Converts travel distances into tacho positions (degrees of wheel rotation).

use std::f64::consts::PI;

use crate::config::WheelGeometry;

/// Wheel rotation in degrees needed to roll `distance` (cm)
pub fn wheel_rotation_degrees(distance: f64, wheel_radius: f64) -> i32 {
    let circumference = 2.0 * PI * wheel_radius;
    ((distance / circumference) * 360.0) as i32
}

/// Arc each wheel travels when the base turns `degrees` in place
pub fn turn_arc_length(degrees: f64, track_width: f64) -> f64 {
    (degrees.abs() / 360.0) * PI * track_width
}

/// Wheel rotation in degrees for an in-place turn of `degrees`
pub fn turn_wheel_rotation(degrees: f64, geometry: &WheelGeometry) -> i32 {
    wheel_rotation_degrees(turn_arc_length(degrees, geometry.track_width), geometry.wheel_radius)
}
