use serde::{Deserialize, Serialize};

/// Pivot dimensionality of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sides {
    Zero,
    One,
    Two,
}

impl Sides {
    #[must_use]
    pub fn from_pivots(group_by: usize, split_by: usize) -> Self {
        if split_by > 0 {
            Self::Two
        } else if group_by > 0 {
            Self::One
        } else {
            Self::Zero
        }
    }

    #[must_use]
    pub fn count(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
        }
    }

    #[must_use]
    pub fn is_pivoted(self) -> bool {
        self != Self::Zero
    }
}

/// The window a view stores as its default read range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Viewport {
    #[serde(default)]
    pub top: Option<usize>,
    #[serde(default)]
    pub left: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
}

/// Caller overrides plus per-call switches for a materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaterializeOptions {
    pub start_row: Option<usize>,
    pub end_row: Option<usize>,
    pub start_col: Option<usize>,
    pub end_col: Option<usize>,
    /// Render date and datetime cells as text in textual outputs.
    pub formatted: bool,
    /// Append primary keys as `__INDEX__`.
    pub index: bool,
    /// Prepend a synthetic `__ID__`.
    pub id: bool,
    /// Skip aggregate rows above the leaf level of a row-pivoted view.
    pub leaves_only: bool,
}

impl MaterializeOptions {
    #[must_use]
    pub fn rows(start_row: usize, end_row: usize) -> Self {
        Self {
            start_row: Some(start_row),
            end_row: Some(end_row),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_columns(mut self, start_col: usize, end_col: usize) -> Self {
        self.start_col = Some(start_col);
        self.end_col = Some(end_col);
        self
    }
}

/// Everything the traversal needs to know about a view's engine-native
/// column layout.
///
/// Engine columns come as one block per split-by group; each block holds
/// the visible output columns followed by the hidden sort columns. Pivoted
/// views reserve engine column 0 for the row path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceLayout {
    pub sides: Sides,
    pub column_only: bool,
    pub visible_columns: usize,
    pub hidden_columns: usize,
    pub group_by_depth: usize,
    pub num_rows: usize,
    /// Engine column count, excluding the row-path column.
    pub num_columns: usize,
}

/// A resolved half-open read window in engine coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
}

impl SliceLayout {
    #[must_use]
    pub fn has_row_path(&self) -> bool {
        self.sides.is_pivoted() && !self.column_only
    }

    #[must_use]
    pub fn path_offset(&self) -> usize {
        usize::from(self.sides.is_pivoted())
    }

    #[must_use]
    pub fn is_path_column(&self, cidx: usize) -> bool {
        self.sides.is_pivoted() && cidx == 0
    }

    /// Hidden sort columns sit at the tail of every group block.
    #[must_use]
    pub fn is_hidden(&self, cidx: usize) -> bool {
        let stride = self.visible_columns + self.hidden_columns;
        if stride == 0 {
            return true;
        }
        let Some(offset) = cidx.checked_sub(self.path_offset()) else {
            return false;
        };
        offset % stride >= self.visible_columns
    }

    /// Visible columns per group block times the number of blocks.
    #[must_use]
    pub fn num_visible_columns(&self) -> usize {
        let stride = self.visible_columns + self.hidden_columns;
        if stride == 0 {
            return 0;
        }
        self.num_columns - (self.num_columns / stride) * self.hidden_columns
    }

    /// Overrides win, then the stored viewport, then the full extent. Column
    /// ends are scaled by `hidden_columns + 1` and shifted past the row-path
    /// column on pivoted views. Everything is clamped to the view's extent.
    #[must_use]
    pub fn resolve_window(
        &self,
        options: &MaterializeOptions,
        viewport: Option<&Viewport>,
    ) -> Window {
        let viewport = viewport.copied().unwrap_or_default();
        let max_rows = self.num_rows;
        let max_cols = self.num_columns + self.path_offset();
        let psp_offset = usize::from(self.sides.is_pivoted() || self.column_only);

        let start_row = options.start_row.or(viewport.top).unwrap_or(0);
        let end_row = options
            .end_row
            .or_else(|| viewport.height.map(|height| start_row.saturating_add(height)))
            .unwrap_or(max_rows)
            .min(max_rows);

        let start_col = options.start_col.or(viewport.left).unwrap_or(0);
        let unscaled_end_col = options
            .end_col
            .map(|end| end.saturating_add(psp_offset))
            .or_else(|| viewport.width.map(|width| start_col.saturating_add(width)))
            .unwrap_or(max_cols);
        let end_col = unscaled_end_col
            .saturating_mul(self.hidden_columns + 1)
            .min(max_cols);

        Window {
            start_row: start_row.min(end_row),
            end_row,
            start_col: start_col.min(end_col),
            end_col,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MaterializeOptions, Sides, SliceLayout, Viewport};

    fn flat(num_rows: usize, visible: usize, hidden: usize) -> SliceLayout {
        SliceLayout {
            sides: Sides::Zero,
            column_only: false,
            visible_columns: visible,
            hidden_columns: hidden,
            group_by_depth: 0,
            num_rows,
            num_columns: visible + hidden,
        }
    }

    #[test]
    fn full_extent_is_the_last_fallback() {
        let window = flat(10, 3, 0).resolve_window(&MaterializeOptions::default(), None);
        assert_eq!((window.start_row, window.end_row), (0, 10));
        assert_eq!((window.start_col, window.end_col), (0, 3));
    }

    #[test]
    fn viewport_is_used_when_no_override() {
        let viewport = Viewport {
            top: Some(2),
            left: Some(1),
            height: Some(3),
            width: Some(1),
        };
        let window = flat(10, 3, 0).resolve_window(&MaterializeOptions::default(), Some(&viewport));
        assert_eq!((window.start_row, window.end_row), (2, 5));
        assert_eq!((window.start_col, window.end_col), (1, 2));

        let options = MaterializeOptions::rows(0, 1);
        let window = flat(10, 3, 0).resolve_window(&options, Some(&viewport));
        assert_eq!((window.start_row, window.end_row), (0, 1));
    }

    #[test]
    fn out_of_range_bounds_are_clamped() {
        let options = MaterializeOptions::rows(50, 100).with_columns(7, 90);
        let window = flat(10, 3, 0).resolve_window(&options, None);
        assert_eq!((window.start_row, window.end_row), (10, 10));
        assert_eq!((window.start_col, window.end_col), (3, 3));
    }

    #[test]
    fn pivoted_end_col_is_shifted_and_scaled() {
        let layout = SliceLayout {
            sides: Sides::One,
            column_only: false,
            visible_columns: 2,
            hidden_columns: 1,
            group_by_depth: 1,
            num_rows: 4,
            num_columns: 3,
        };
        let options = MaterializeOptions::default().with_columns(0, 1);
        let window = layout.resolve_window(&options, None);
        assert_eq!(window.end_col, 4);
        assert!(layout.is_path_column(0));
        assert!(!layout.is_hidden(1));
        assert!(!layout.is_hidden(2));
        assert!(layout.is_hidden(3));
    }

    #[test]
    fn hidden_columns_repeat_per_split_group() {
        let layout = SliceLayout {
            sides: Sides::Two,
            column_only: true,
            visible_columns: 1,
            hidden_columns: 1,
            group_by_depth: 0,
            num_rows: 1,
            num_columns: 4,
        };
        let hidden: Vec<usize> = (1..5).filter(|cidx| layout.is_hidden(*cidx)).collect();
        assert_eq!(hidden, vec![2, 4]);
        assert_eq!(layout.num_visible_columns(), 2);
        assert!(!layout.has_row_path());
    }

    #[test]
    fn sides_follow_pivot_lists() {
        assert_eq!(Sides::from_pivots(0, 0), Sides::Zero);
        assert_eq!(Sides::from_pivots(2, 0), Sides::One);
        assert_eq!(Sides::from_pivots(0, 1), Sides::Two);
        assert_eq!(Sides::from_pivots(1, 1).count(), 2);
    }
}
