/// Thermometer encoding of the signed offset between two propositions.
///
/// The vector has `2 * max_distance` cells: the left half fills for negative
/// offsets, the right half for positive ones, each growing outward from the
/// centre. Offsets beyond `max_distance` saturate a full half.
pub fn encode_distance(difference: i64, max_distance: usize) -> Vec<f32> {
    let mut cells = vec![0.0; 2 * max_distance];
    if max_distance == 0 || difference == 0 {
        return cells;
    }

    let reach = difference.unsigned_abs().min(max_distance as u64) as usize;
    let range = if difference > 0 {
        max_distance..max_distance + reach
    } else {
        max_distance - reach..max_distance
    };
    for cell in &mut cells[range] {
        *cell = 1.0;
    }
    cells
}
