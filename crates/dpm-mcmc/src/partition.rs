use std::fmt::Debug;

use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError, ParameterId};
use serde::{Deserialize, Serialize};

/// Change tag carried by a parameter list between two checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    /// Clean: no mutation since the last `store`/`restore`.
    None,
    /// A cluster was appended without splitting an existing one.
    Added,
    /// A cluster was removed without being merged.
    Removed,
    /// A cluster was split; the new cluster sits at the end of the list.
    Split,
    /// A cluster was absorbed into another one.
    Merge,
    /// A single value was overwritten in place.
    ValueChanged,
    /// Bulk replacement or several mutations within one step.
    All,
}

impl ChangeType {
    /// Returns `true` for tags that alter the number of clusters.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChangeType::Added | ChangeType::Removed | ChangeType::Split | ChangeType::Merge
        )
    }

    fn combine(self, next: ChangeType) -> ChangeType {
        if self == ChangeType::None {
            next
        } else {
            ChangeType::All
        }
    }
}

/// The four per-cluster parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterKind {
    /// Overall site rate.
    Rate,
    /// Gamma shape parameter.
    Shape,
    /// Proportion of invariant sites.
    InvariantProportion,
    /// Discrete site-model indicator.
    ModelChoice,
}

impl ParameterKind {
    /// All kinds in list order.
    pub const ALL: [ParameterKind; 4] = [
        ParameterKind::Rate,
        ParameterKind::Shape,
        ParameterKind::InvariantProportion,
        ParameterKind::ModelChoice,
    ];

    /// Stable label used in logs and error context.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::Rate => "rate",
            ParameterKind::Shape => "shape",
            ParameterKind::InvariantProportion => "invariant-proportion",
            ParameterKind::ModelChoice => "model-choice",
        }
    }
}

/// Closed interval a parameter value is clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Inclusive lower bound.
    pub lower: f64,
    /// Inclusive upper bound.
    pub upper: f64,
}

impl Bounds {
    /// Creates bounds, rejecting NaN or inverted intervals.
    pub fn new(lower: f64, upper: f64) -> Result<Self, DpmError> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(DpmError::Config(
                ErrorInfo::new("invalid-bounds", "lower bound must not exceed upper bound")
                    .with_context("lower", lower)
                    .with_context("upper", upper),
            ));
        }
        Ok(Self { lower, upper })
    }

    /// The whole real line.
    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// `[0, +inf)`, used by rates and shapes.
    pub fn non_negative() -> Self {
        Self {
            lower: 0.0,
            upper: f64::INFINITY,
        }
    }

    /// `[0, 1]`, used by proportions.
    pub fn unit() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }

    /// Returns `true` when `value` lies within the interval.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Clamps `value` into the interval.
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// One cluster entry of a [`ClusterParameterList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSlot<V> {
    /// Stable identity of the parameter.
    pub id: ParameterId,
    /// Current value.
    pub value: V,
}

/// Ordered per-cluster parameter values with change tracking and a checkpoint.
#[derive(Debug, Clone)]
pub struct ClusterParameterList<V> {
    kind: ParameterKind,
    bounds: Bounds,
    slots: Vec<ClusterSlot<V>>,
    change: ChangeType,
    last_added: Option<ClusterId>,
    last_removed: Option<ClusterId>,
    last_changed: Option<ClusterId>,
    stored: Vec<ClusterSlot<V>>,
}

impl<V: Clone + Debug> ClusterParameterList<V> {
    /// Creates a clean list whose checkpoint equals its initial content.
    pub fn new(kind: ParameterKind, bounds: Bounds, slots: Vec<ClusterSlot<V>>) -> Self {
        Self {
            kind,
            bounds,
            stored: slots.clone(),
            slots,
            change: ChangeType::None,
            last_added: None,
            last_removed: None,
            last_changed: None,
        }
    }

    /// Parameter kind held by this list.
    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    /// Declared bounds of the values.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Number of clusters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when the list holds no cluster.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots in cluster order.
    pub fn slots(&self) -> &[ClusterSlot<V>] {
        &self.slots
    }

    /// Value of the given cluster.
    pub fn get(&self, cluster: ClusterId) -> Result<&V, DpmError> {
        self.slot(cluster).map(|slot| &slot.value)
    }

    /// Stable identity of the given cluster's parameter.
    pub fn parameter_id(&self, cluster: ClusterId) -> Result<ParameterId, DpmError> {
        self.slot(cluster).map(|slot| slot.id)
    }

    /// Current position of the parameter with the given identity.
    pub fn position_of(&self, id: ParameterId) -> Option<ClusterId> {
        self.slots
            .iter()
            .position(|slot| slot.id == id)
            .map(ClusterId::from_raw)
    }

    /// Current change tag.
    pub fn change_type(&self) -> ChangeType {
        self.change
    }

    /// Returns `true` when the list was mutated since the last checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.change != ChangeType::None
    }

    /// Position of the most recently added cluster.
    pub fn last_added_id(&self) -> Option<ClusterId> {
        self.last_added
    }

    /// Position the most recently removed cluster occupied before removal.
    pub fn last_removed_id(&self) -> Option<ClusterId> {
        self.last_removed
    }

    /// Position of the most recent in-place value change.
    pub fn last_changed_id(&self) -> Option<ClusterId> {
        self.last_changed
    }

    /// Appends a new cluster cloned off `cluster` with a fresh value.
    ///
    /// The original cluster keeps its position; the new one is appended.
    pub fn split(
        &mut self,
        cluster: ClusterId,
        id: ParameterId,
        value: V,
    ) -> Result<ClusterId, DpmError> {
        self.slot(cluster)?;
        let added = self.push(id, value);
        self.mark(ChangeType::Split);
        Ok(added)
    }

    /// Absorbs `absorbed` into `survivor`, removing the absorbed slot.
    ///
    /// Returns the survivor's position after the removal.
    pub fn merge(
        &mut self,
        absorbed: ClusterId,
        survivor: ClusterId,
    ) -> Result<ClusterId, DpmError> {
        self.slot(survivor)?;
        if absorbed == survivor {
            return Err(self.error(
                "merge-same-cluster",
                "cannot merge a cluster into itself",
                absorbed,
            ));
        }
        self.pop(absorbed)?;
        self.mark(ChangeType::Merge);
        Ok(shift_after_removal(survivor, absorbed))
    }

    /// Appends a cluster that does not originate from a split.
    pub fn add(&mut self, id: ParameterId, value: V) -> ClusterId {
        let added = self.push(id, value);
        self.mark(ChangeType::Added);
        added
    }

    /// Removes a cluster without merging it.
    pub fn remove(&mut self, cluster: ClusterId) -> Result<ClusterSlot<V>, DpmError> {
        let slot = self.pop(cluster)?;
        self.mark(ChangeType::Removed);
        Ok(slot)
    }

    /// Overwrites a single value in place.
    pub fn set_value(&mut self, cluster: ClusterId, value: V) -> Result<(), DpmError> {
        self.slot(cluster)?;
        self.slots[cluster.as_raw()].value = value;
        self.last_changed = Some(cluster);
        self.mark(ChangeType::ValueChanged);
        Ok(())
    }

    /// Replaces every slot at once.
    pub fn replace_all(&mut self, slots: Vec<ClusterSlot<V>>) {
        self.slots = slots;
        self.mark(ChangeType::All);
    }

    /// Accepts the current content as the new checkpoint.
    pub fn store(&mut self) {
        self.stored = self.slots.clone();
        self.clean();
    }

    /// Discards every mutation since the last checkpoint.
    pub fn restore(&mut self) {
        self.slots = self.stored.clone();
        self.clean();
    }

    fn clean(&mut self) {
        self.change = ChangeType::None;
        self.last_added = None;
        self.last_removed = None;
        self.last_changed = None;
    }

    fn push(&mut self, id: ParameterId, value: V) -> ClusterId {
        self.slots.push(ClusterSlot { id, value });
        let added = ClusterId::from_raw(self.slots.len() - 1);
        self.last_added = Some(added);
        added
    }

    fn pop(&mut self, cluster: ClusterId) -> Result<ClusterSlot<V>, DpmError> {
        self.slot(cluster)?;
        let slot = self.slots.remove(cluster.as_raw());
        self.last_removed = Some(cluster);
        Ok(slot)
    }

    fn mark(&mut self, change: ChangeType) {
        self.change = self.change.combine(change);
    }

    fn slot(&self, cluster: ClusterId) -> Result<&ClusterSlot<V>, DpmError> {
        self.slots.get(cluster.as_raw()).ok_or_else(|| {
            self.error("unknown-cluster", "cluster id out of range", cluster)
                .with_context("clusters", self.slots.len())
        })
    }

    fn error(&self, code: &str, message: &str, cluster: ClusterId) -> DpmError {
        DpmError::Consistency(
            ErrorInfo::new(code, message)
                .with_context("list", self.kind.as_str())
                .with_context("cluster", cluster),
        )
    }
}

fn shift_after_removal(cluster: ClusterId, removed: ClusterId) -> ClusterId {
    if cluster > removed {
        ClusterId::from_raw(cluster.as_raw() - 1)
    } else {
        cluster
    }
}

/// Parameter vector shared by every item of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Overall site rate.
    pub rate: f64,
    /// Gamma shape parameter.
    pub shape: f64,
    /// Proportion of invariant sites.
    pub invariant_proportion: f64,
    /// Discrete site-model indicator.
    pub model_choice: i64,
}

/// Declared bounds of the four parameter lists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionBounds {
    /// Bounds of the rate list.
    pub rate: Bounds,
    /// Bounds of the shape list.
    pub shape: Bounds,
    /// Bounds of the invariant-proportion list.
    pub invariant_proportion: Bounds,
    /// Bounds of the model-choice list.
    pub model_choice: Bounds,
}

impl Default for PartitionBounds {
    fn default() -> Self {
        Self {
            rate: Bounds::non_negative(),
            shape: Bounds::non_negative(),
            invariant_proportion: Bounds::unit(),
            model_choice: Bounds::unbounded(),
        }
    }
}

/// Items partitioned into clusters, each owning one [`ClusterParams`].
///
/// The partition owns the item pointer map and four parallel parameter lists
/// that always share cardinality and cluster numbering. Structural edits go
/// through [`ClusterPartition::split`], [`ClusterPartition::merge`],
/// [`ClusterPartition::add`], [`ClusterPartition::remove`] and
/// [`ClusterPartition::replace_all`], which mutate all four lists in the same
/// step.
#[derive(Debug, Clone)]
pub struct ClusterPartition {
    pointers: Vec<ClusterId>,
    rates: ClusterParameterList<f64>,
    shapes: ClusterParameterList<f64>,
    invariant_proportions: ClusterParameterList<f64>,
    model_choices: ClusterParameterList<i64>,
    next_parameter: u64,
    stored_pointers: Vec<ClusterId>,
    stored_next_parameter: u64,
}

impl ClusterPartition {
    /// Builds a partition from raw item pointers and per-cluster parameters.
    pub fn new(
        pointers: &[usize],
        clusters: &[ClusterParams],
        bounds: PartitionBounds,
    ) -> Result<Self, DpmError> {
        let ids: Vec<ParameterId> = (0..clusters.len() as u64)
            .map(ParameterId::from_raw)
            .collect();
        let slots = |value: fn(&ClusterParams) -> f64| -> Vec<ClusterSlot<f64>> {
            ids.iter()
                .zip(clusters)
                .map(|(id, params)| ClusterSlot {
                    id: *id,
                    value: value(params),
                })
                .collect()
        };
        let model_slots = ids
            .iter()
            .zip(clusters)
            .map(|(id, params)| ClusterSlot {
                id: *id,
                value: params.model_choice,
            })
            .collect();
        Self::from_parts(
            pointers.iter().copied().map(ClusterId::from_raw).collect(),
            ClusterParameterList::new(ParameterKind::Rate, bounds.rate, slots(|p| p.rate)),
            ClusterParameterList::new(ParameterKind::Shape, bounds.shape, slots(|p| p.shape)),
            ClusterParameterList::new(
                ParameterKind::InvariantProportion,
                bounds.invariant_proportion,
                slots(|p| p.invariant_proportion),
            ),
            ClusterParameterList::new(ParameterKind::ModelChoice, bounds.model_choice, model_slots),
            clusters.len() as u64,
        )
    }

    /// Assembles a partition from already-built lists and validates it.
    pub fn from_parts(
        pointers: Vec<ClusterId>,
        rates: ClusterParameterList<f64>,
        shapes: ClusterParameterList<f64>,
        invariant_proportions: ClusterParameterList<f64>,
        model_choices: ClusterParameterList<i64>,
        next_parameter: u64,
    ) -> Result<Self, DpmError> {
        let partition = Self {
            stored_pointers: pointers.clone(),
            stored_next_parameter: next_parameter,
            pointers,
            rates,
            shapes,
            invariant_proportions,
            model_choices,
            next_parameter,
        };
        partition.validate()?;
        Ok(partition)
    }

    /// Number of items.
    pub fn item_count(&self) -> usize {
        self.pointers.len()
    }

    /// Number of clusters.
    pub fn cluster_count(&self) -> usize {
        self.rates.len()
    }

    /// Item to cluster map.
    pub fn pointers(&self) -> &[ClusterId] {
        &self.pointers
    }

    /// Cluster currently holding `item`.
    pub fn cluster_of(&self, item: usize) -> Result<ClusterId, DpmError> {
        self.pointers.get(item).copied().ok_or_else(|| {
            DpmError::Consistency(
                ErrorInfo::new("unknown-item", "item index out of range")
                    .with_context("item", item)
                    .with_context("items", self.pointers.len()),
            )
        })
    }

    /// Items of `cluster` in ascending order.
    pub fn members(&self, cluster: ClusterId) -> Vec<usize> {
        self.pointers
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == cluster)
            .map(|(item, _)| item)
            .collect()
    }

    /// Occupancy of every cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.cluster_count()];
        for owner in &self.pointers {
            if let Some(size) = sizes.get_mut(owner.as_raw()) {
                *size += 1;
            }
        }
        sizes
    }

    /// Parameter vector of `cluster`.
    pub fn params(&self, cluster: ClusterId) -> Result<ClusterParams, DpmError> {
        Ok(ClusterParams {
            rate: *self.rates.get(cluster)?,
            shape: *self.shapes.get(cluster)?,
            invariant_proportion: *self.invariant_proportions.get(cluster)?,
            model_choice: *self.model_choices.get(cluster)?,
        })
    }

    /// Identity of `cluster`'s rate parameter, the key used for cached likelihoods.
    pub fn parameter_id(&self, cluster: ClusterId) -> Result<ParameterId, DpmError> {
        self.rates.parameter_id(cluster)
    }

    /// Rate list.
    pub fn rates(&self) -> &ClusterParameterList<f64> {
        &self.rates
    }

    /// Shape list.
    pub fn shapes(&self) -> &ClusterParameterList<f64> {
        &self.shapes
    }

    /// Invariant-proportion list.
    pub fn invariant_proportions(&self) -> &ClusterParameterList<f64> {
        &self.invariant_proportions
    }

    /// Model-choice list.
    pub fn model_choices(&self) -> &ClusterParameterList<i64> {
        &self.model_choices
    }

    /// Low-level access to the rate list. Structural edits must be mirrored on all lists.
    pub fn rates_mut(&mut self) -> &mut ClusterParameterList<f64> {
        &mut self.rates
    }

    /// Low-level access to the shape list. Structural edits must be mirrored on all lists.
    pub fn shapes_mut(&mut self) -> &mut ClusterParameterList<f64> {
        &mut self.shapes
    }

    /// Low-level access to the invariant-proportion list.
    pub fn invariant_proportions_mut(&mut self) -> &mut ClusterParameterList<f64> {
        &mut self.invariant_proportions
    }

    /// Low-level access to the model-choice list.
    pub fn model_choices_mut(&mut self) -> &mut ClusterParameterList<i64> {
        &mut self.model_choices
    }

    /// Next parameter identity that a split will hand out.
    pub fn next_parameter(&self) -> u64 {
        self.next_parameter
    }

    /// Splits `source`, moving `movers` into a new cluster holding `params`.
    ///
    /// Returns the id of the new cluster, which is appended after all
    /// existing clusters.
    pub fn split(
        &mut self,
        source: ClusterId,
        params: ClusterParams,
        movers: &[usize],
    ) -> Result<ClusterId, DpmError> {
        let mut distinct = movers.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        let remaining = self.members(source).len();
        if movers.is_empty() || distinct.len() != movers.len() || remaining <= movers.len() {
            return Err(DpmError::Consistency(
                ErrorInfo::new("split-empty-side", "split must leave both clusters non-empty")
                    .with_context("source", source)
                    .with_context("movers", movers.len())
                    .with_context("members", remaining),
            ));
        }
        for &item in movers {
            if self.cluster_of(item)? != source {
                return Err(DpmError::Consistency(
                    ErrorInfo::new("split-foreign-item", "split moves an item of another cluster")
                        .with_context("item", item)
                        .with_context("source", source),
                ));
            }
        }
        let id = ParameterId::from_raw(self.next_parameter);
        let added = [
            self.rates.split(source, id, params.rate)?,
            self.shapes.split(source, id, params.shape)?,
            self.invariant_proportions
                .split(source, id, params.invariant_proportion)?,
            self.model_choices.split(source, id, params.model_choice)?,
        ];
        ensure_same_position("split", &added)?;
        self.next_parameter += 1;
        for &item in movers {
            self.pointers[item] = added[0];
        }
        self.validate()?;
        Ok(added[0])
    }

    /// Merges `absorbed` into `survivor`; the survivor keeps its parameters.
    ///
    /// Returns the survivor's id after the absorbed slot is removed.
    pub fn merge(
        &mut self,
        absorbed: ClusterId,
        survivor: ClusterId,
    ) -> Result<ClusterId, DpmError> {
        let merged = [
            self.rates.merge(absorbed, survivor)?,
            self.shapes.merge(absorbed, survivor)?,
            self.invariant_proportions.merge(absorbed, survivor)?,
            self.model_choices.merge(absorbed, survivor)?,
        ];
        ensure_same_position("merge", &merged)?;
        let survivor_after = merged[0];
        for owner in self.pointers.iter_mut() {
            if *owner == absorbed {
                *owner = survivor_after;
            } else {
                *owner = shift_after_removal(*owner, absorbed);
            }
        }
        self.validate()?;
        Ok(survivor_after)
    }

    /// Moves `items` out of their clusters into a new cluster holding `params`.
    ///
    /// Unlike a split, the items may come from several clusters, but none of
    /// those clusters may be left empty. The new cluster is appended.
    pub fn add(&mut self, params: ClusterParams, items: &[usize]) -> Result<ClusterId, DpmError> {
        let mut distinct = items.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if items.is_empty() || distinct.len() != items.len() {
            return Err(DpmError::Consistency(
                ErrorInfo::new("add-invalid-items", "a new cluster needs distinct items")
                    .with_context("items", items.len()),
            ));
        }
        let mut sizes = self.cluster_sizes();
        for &item in items {
            let owner = self.cluster_of(item)?;
            sizes[owner.as_raw()] -= 1;
            if sizes[owner.as_raw()] == 0 {
                return Err(DpmError::Consistency(
                    ErrorInfo::new("add-empties-cluster", "adding would leave a cluster empty")
                        .with_context("cluster", owner),
                ));
            }
        }
        let id = ParameterId::from_raw(self.next_parameter);
        let added = [
            self.rates.add(id, params.rate),
            self.shapes.add(id, params.shape),
            self.invariant_proportions
                .add(id, params.invariant_proportion),
            self.model_choices.add(id, params.model_choice),
        ];
        ensure_same_position("add", &added)?;
        self.next_parameter += 1;
        for &item in items {
            self.pointers[item] = added[0];
        }
        self.validate()?;
        Ok(added[0])
    }

    /// Deletes `cluster` and reassigns its items to `target`.
    ///
    /// The target keeps its parameters; the result is its id after removal.
    pub fn remove(&mut self, cluster: ClusterId, target: ClusterId) -> Result<ClusterId, DpmError> {
        self.rates.get(target)?;
        if cluster == target {
            return Err(DpmError::Consistency(
                ErrorInfo::new("remove-into-self", "items cannot be reassigned to a removed cluster")
                    .with_context("cluster", cluster),
            ));
        }
        self.rates.remove(cluster)?;
        self.shapes.remove(cluster)?;
        self.invariant_proportions.remove(cluster)?;
        self.model_choices.remove(cluster)?;
        let target_after = shift_after_removal(target, cluster);
        for owner in self.pointers.iter_mut() {
            *owner = if *owner == cluster {
                target_after
            } else {
                shift_after_removal(*owner, cluster)
            };
        }
        self.validate()?;
        Ok(target_after)
    }

    /// Replaces the whole partition in one bulk edit tagged [`ChangeType::All`].
    ///
    /// Every cluster receives a fresh parameter identity. The partition is
    /// left untouched when the replacement is invalid.
    pub fn replace_all(
        &mut self,
        pointers: &[usize],
        clusters: &[ClusterParams],
    ) -> Result<(), DpmError> {
        if pointers.len() != self.item_count() {
            return Err(DpmError::Consistency(
                ErrorInfo::new("item-count-mismatch", "bulk replacement must keep every item")
                    .with_context("items", self.item_count())
                    .with_context("pointers", pointers.len()),
            ));
        }
        let mut next = self.clone();
        let ids: Vec<ParameterId> = (0..clusters.len() as u64)
            .map(|offset| ParameterId::from_raw(self.next_parameter + offset))
            .collect();
        let slots = |value: fn(&ClusterParams) -> f64| -> Vec<ClusterSlot<f64>> {
            ids.iter()
                .zip(clusters)
                .map(|(id, params)| ClusterSlot {
                    id: *id,
                    value: value(params),
                })
                .collect()
        };
        next.rates.replace_all(slots(|p| p.rate));
        next.shapes.replace_all(slots(|p| p.shape));
        next.invariant_proportions
            .replace_all(slots(|p| p.invariant_proportion));
        next.model_choices.replace_all(
            ids.iter()
                .zip(clusters)
                .map(|(id, params)| ClusterSlot {
                    id: *id,
                    value: params.model_choice,
                })
                .collect(),
        );
        next.pointers = pointers.iter().copied().map(ClusterId::from_raw).collect();
        next.next_parameter += clusters.len() as u64;
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Overwrites every parameter of `cluster` in place.
    pub fn set_params(&mut self, cluster: ClusterId, params: ClusterParams) -> Result<(), DpmError> {
        self.rates.set_value(cluster, params.rate)?;
        self.shapes.set_value(cluster, params.shape)?;
        self.invariant_proportions
            .set_value(cluster, params.invariant_proportion)?;
        self.model_choices.set_value(cluster, params.model_choice)
    }

    /// Change tags of the four lists in [`ParameterKind::ALL`] order.
    pub fn change_types(&self) -> [ChangeType; 4] {
        [
            self.rates.change_type(),
            self.shapes.change_type(),
            self.invariant_proportions.change_type(),
            self.model_choices.change_type(),
        ]
    }

    /// The single change tag active across the coupled lists.
    ///
    /// Structural tags must be identical on all four lists; anything else is a
    /// fatal consistency error. Value changes on a subset of lists collapse to
    /// [`ChangeType::ValueChanged`].
    pub fn change_type(&self) -> Result<ChangeType, DpmError> {
        let tags = self.change_types();
        let structural = tags.iter().any(ChangeType::is_structural);
        if structural {
            if tags.iter().all(|tag| *tag == tags[0]) {
                return Ok(tags[0]);
            }
            return Err(change_mismatch(&tags));
        }
        if tags.contains(&ChangeType::All) {
            return Ok(ChangeType::All);
        }
        if tags.contains(&ChangeType::ValueChanged) {
            return Ok(ChangeType::ValueChanged);
        }
        Ok(ChangeType::None)
    }

    /// Position of the cluster added in this step, identical across lists.
    pub fn last_added_id(&self) -> Result<Option<ClusterId>, DpmError> {
        agree(
            "last-added-mismatch",
            [
                self.rates.last_added_id(),
                self.shapes.last_added_id(),
                self.invariant_proportions.last_added_id(),
                self.model_choices.last_added_id(),
            ],
        )
    }

    /// Position of the cluster removed in this step, identical across lists.
    pub fn last_removed_id(&self) -> Result<Option<ClusterId>, DpmError> {
        agree(
            "last-removed-mismatch",
            [
                self.rates.last_removed_id(),
                self.shapes.last_removed_id(),
                self.invariant_proportions.last_removed_id(),
                self.model_choices.last_removed_id(),
            ],
        )
    }

    /// Cluster whose value changed in this step, when a single one did.
    pub fn last_changed_id(&self) -> Option<ClusterId> {
        let changed: Vec<ClusterId> = [
            self.rates.last_changed_id(),
            self.shapes.last_changed_id(),
            self.invariant_proportions.last_changed_id(),
            self.model_choices.last_changed_id(),
        ]
        .into_iter()
        .flatten()
        .collect();
        match changed.split_first() {
            Some((first, rest)) if rest.iter().all(|id| id == first) => Some(*first),
            _ => None,
        }
    }

    /// Accepts the current state as the new checkpoint.
    pub fn store(&mut self) {
        self.rates.store();
        self.shapes.store();
        self.invariant_proportions.store();
        self.model_choices.store();
        self.stored_pointers = self.pointers.clone();
        self.stored_next_parameter = self.next_parameter;
    }

    /// Rolls back every mutation since the last checkpoint.
    pub fn restore(&mut self) {
        self.rates.restore();
        self.shapes.restore();
        self.invariant_proportions.restore();
        self.model_choices.restore();
        self.pointers = self.stored_pointers.clone();
        self.next_parameter = self.stored_next_parameter;
    }

    /// Checks the partition invariants.
    ///
    /// All four lists share cardinality and parameter identities, every item
    /// points at an existing cluster, and no cluster is empty.
    pub fn validate(&self) -> Result<(), DpmError> {
        let lengths = [
            self.rates.len(),
            self.shapes.len(),
            self.invariant_proportions.len(),
            self.model_choices.len(),
        ];
        if lengths.iter().any(|len| *len != lengths[0]) {
            return Err(DpmError::Consistency(
                ErrorInfo::new("cardinality-mismatch", "parameter lists differ in length")
                    .with_context("lengths", format!("{lengths:?}")),
            ));
        }
        for position in 0..lengths[0] {
            let cluster = ClusterId::from_raw(position);
            let id = self.rates.parameter_id(cluster)?;
            let others = [
                self.shapes.parameter_id(cluster)?,
                self.invariant_proportions.parameter_id(cluster)?,
                self.model_choices.parameter_id(cluster)?,
            ];
            if others.iter().any(|other| *other != id) {
                return Err(DpmError::Consistency(
                    ErrorInfo::new("identity-mismatch", "cluster numbering differs across lists")
                        .with_context("cluster", cluster),
                ));
            }
        }
        let sizes = self.cluster_sizes();
        if let Some(item) = self
            .pointers
            .iter()
            .position(|owner| owner.as_raw() >= lengths[0])
        {
            return Err(DpmError::Consistency(
                ErrorInfo::new("dangling-pointer", "item points at a missing cluster")
                    .with_context("item", item)
                    .with_context("cluster", self.pointers[item])
                    .with_context("clusters", lengths[0]),
            ));
        }
        if let Some(empty) = sizes.iter().position(|size| *size == 0) {
            return Err(DpmError::Consistency(
                ErrorInfo::new("empty-cluster", "cluster has no items")
                    .with_context("cluster", ClusterId::from_raw(empty)),
            ));
        }
        Ok(())
    }
}

fn ensure_same_position(operation: &str, positions: &[ClusterId; 4]) -> Result<(), DpmError> {
    if positions.iter().all(|pos| *pos == positions[0]) {
        Ok(())
    } else {
        Err(DpmError::Consistency(
            ErrorInfo::new("position-mismatch", "coupled lists disagree on cluster position")
                .with_context("operation", operation)
                .with_context("positions", format!("{positions:?}")),
        ))
    }
}

fn agree(code: &str, values: [Option<ClusterId>; 4]) -> Result<Option<ClusterId>, DpmError> {
    if values.iter().all(|value| *value == values[0]) {
        Ok(values[0])
    } else {
        Err(DpmError::Consistency(
            ErrorInfo::new(code, "coupled lists disagree on the touched cluster")
                .with_context("values", format!("{values:?}")),
        ))
    }
}

fn change_mismatch(tags: &[ChangeType; 4]) -> DpmError {
    let mut info = ErrorInfo::new(
        "change-type-mismatch",
        "can only handle the same type of change on all parameter lists",
    );
    for (kind, tag) in ParameterKind::ALL.iter().zip(tags.iter()) {
        info = info.with_context(kind.as_str(), format!("{tag:?}"));
    }
    DpmError::Consistency(info)
}
