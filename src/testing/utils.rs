/// Positions of group 1 (`false`) and group 2 (`true`) cells
pub fn split_by_indicator(indicator: &[bool]) -> (Vec<usize>, Vec<usize>) {
    let group1_indices = indicator
        .iter()
        .enumerate()
        .filter_map(|(i, &x)| if !x { Some(i) } else { None })
        .collect();

    let group2_indices = indicator
        .iter()
        .enumerate()
        .filter_map(|(i, &x)| if x { Some(i) } else { None })
        .collect();

    (group1_indices, group2_indices)
}
