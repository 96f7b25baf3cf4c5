use log::debug;
use petgraph::Direction;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum FrameGraphError {
    #[error("Duplicate resource name '{name}'")]
    DuplicateResourceName { name: String },

    #[error("Pass '{pass}' references unknown resource {id:?}")]
    ResourceNotFound { pass: String, id: ResourceId },

    #[error("Resource '{resource}' is never referenced by any pass")]
    ResourceNeverReferenced { resource: String },

    #[error("Pass '{pass}': resource '{resource}' does not support {states:?} (flags: {flags:?})")]
    UnsupportedState {
        pass: String,
        resource: String,
        states: ResourceStates,
        flags: ResourceFlags,
    },

    #[error("Resource '{resource}' requires conflicting states {states:?} at dependency level {level}")]
    ConflictingStates {
        resource: String,
        states: ResourceStates,
        level: u32,
    },

    #[error("Frame graph contains cycles")]
    CyclicDependency,

    #[error("No placement found for {resource:?} ({chunks} chunks in a {rows}-row grid)")]
    PlacementFailed {
        resource: ResourceId,
        chunks: u32,
        rows: u32,
    },

    #[error("Split barrier for {resource:?} at level {level} has no matching half")]
    UnmatchedSplitBarrier { resource: ResourceId, level: u32 },

    #[error("Device failed to create {what} for '{name}': {reason}")]
    DeviceCreation {
        what: &'static str,
        name: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, FrameGraphError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

pub const BACKBUFFER: ResourceId = ResourceId(0);

pub const CHUNK_SIZE: u64 = 4096;
pub const SMALL_PLACEMENT_ALIGNMENT: u64 = 4096;
pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 65536;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const TEXTURE_3D = 1 << 4;
        const CUBE_MAP = 1 << 5;
        const SIMULTANEOUS_ACCESS = 1 << 6;
        const TEMPORAL = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const PRESENT = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_WRITE = 1 << 2;
        const DEPTH_READ = 1 << 3;
        const SHADER_RESOURCE = 1 << 4;
        const UNORDERED_ACCESS = 1 << 5;
        const COPY_SOURCE = 1 << 6;
        const COPY_DEST = 1 << 7;
    }
}

impl ResourceStates {
    pub fn has_write(self) -> bool {
        self.intersects(
            Self::RENDER_TARGET | Self::DEPTH_WRITE | Self::UNORDERED_ACCESS | Self::COPY_DEST,
        )
    }

    pub fn has_read(self) -> bool {
        self.intersects(Self::DEPTH_READ | Self::SHADER_RESOURCE | Self::COPY_SOURCE)
    }
}

impl ResourceFlags {
    pub fn supports(self, states: ResourceStates) -> bool {
        if states.contains(ResourceStates::RENDER_TARGET) && !self.contains(Self::RENDER_TARGET) {
            return false;
        }
        if states.intersects(ResourceStates::DEPTH_WRITE | ResourceStates::DEPTH_READ)
            && !self.contains(Self::DEPTH_STENCIL)
        {
            return false;
        }
        if states.contains(ResourceStates::UNORDERED_ACCESS)
            && !self.contains(Self::UNORDERED_ACCESS)
        {
            return false;
        }
        if states.contains(ResourceStates::SHADER_RESOURCE)
            && !self.contains(Self::SHADER_RESOURCE)
        {
            return false;
        }
        true
    }

    pub fn heap_category(self) -> HeapCategory {
        if self.intersects(Self::RENDER_TARGET | Self::DEPTH_STENCIL) {
            HeapCategory::RtDs
        } else {
            HeapCategory::Generic
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgb10a2Unorm,
    Rg11b10Float,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rg8Unorm => 2,
            PixelFormat::Rgba8Unorm
            | PixelFormat::Rgba8UnormSrgb
            | PixelFormat::Rgb10a2Unorm
            | PixelFormat::Rg11b10Float
            | PixelFormat::R32Float
            | PixelFormat::Depth32Float
            | PixelFormat::Depth24PlusStencil8 => 4,
            PixelFormat::R16Float => 2,
            PixelFormat::Rg16Float => 4,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth32Float | PixelFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, PixelFormat::Depth24PlusStencil8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum ResourceKind {
    Texture(TextureDesc),
    Buffer(BufferDesc),
}

#[derive(Debug, Clone)]
pub struct FrameResourceDescriptor {
    pub name: String,
    pub kind: ResourceKind,
    pub flags: ResourceFlags,
    pub clear_value: Option<ClearValue>,
}

impl FrameResourceDescriptor {
    pub fn size_bytes(&self) -> u64 {
        match &self.kind {
            ResourceKind::Buffer(desc) => desc.size.max(1),
            ResourceKind::Texture(desc) => {
                let bpp = desc.format.bytes_per_pixel();
                let is_3d = self.flags.contains(ResourceFlags::TEXTURE_3D);
                let layers = if is_3d {
                    1
                } else {
                    u64::from(desc.depth_or_array_layers.max(1))
                };
                let mut width = u64::from(desc.width.max(1));
                let mut height = u64::from(desc.height.max(1));
                let mut depth = if is_3d {
                    u64::from(desc.depth_or_array_layers.max(1))
                } else {
                    1
                };
                let mut total = 0;
                for _ in 0..desc.mip_level_count.max(1) {
                    total += width * height * depth * bpp;
                    width = (width / 2).max(1);
                    height = (height / 2).max(1);
                    depth = (depth / 2).max(1);
                }
                total * layers
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub level: u32,
    pub states: ResourceStates,
}

#[derive(Debug, Clone)]
pub struct ResourceTimeline {
    pub resource: ResourceId,
    pub entries: Vec<TimelineEntry>,
}

impl ResourceTimeline {
    fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            entries: Vec::new(),
        }
    }

    // Entries arrive in ascending level order; consecutive equal states need
    // no barrier and are coalesced here.
    fn push(&mut self, level: u32, states: ResourceStates) {
        if let Some(last) = self.entries.last()
            && last.states == states
        {
            return;
        }
        self.entries.push(TimelineEntry { level, states });
    }

    pub fn first_level(&self) -> u32 {
        self.entries.first().map(|entry| entry.level).unwrap_or(0)
    }

    pub fn last_level(&self) -> u32 {
        self.entries.last().map(|entry| entry.level).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Immediate,
    SplitBegin,
    SplitEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierEntry {
    pub resource: ResourceId,
    pub kind: BarrierKind,
    pub before: ResourceStates,
    pub after: ResourceStates,
}

#[derive(Debug, Clone, Default)]
pub struct LevelBarriers {
    pub begin: Vec<BarrierEntry>,
    pub end: Vec<BarrierEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHeapTier {
    Tier1,
    Tier2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapCategory {
    RtDs,
    Generic,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasingMode {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub aliasing: AliasingMode,
    pub chunk_size: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            aliasing: AliasingMode::Enabled,
            chunk_size: CHUNK_SIZE,
        }
    }
}

pub trait RenderDevice {
    type Heap;
    type Resource;

    fn heap_tier(&self) -> ResourceHeapTier;
    fn placement_alignment(&self, desc: &FrameResourceDescriptor) -> u64;
    fn create_heap(
        &self,
        category: HeapCategory,
        size_bytes: u64,
    ) -> std::result::Result<Self::Heap, String>;
    fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset_bytes: u64,
        desc: &FrameResourceDescriptor,
        initial_states: ResourceStates,
    ) -> std::result::Result<Self::Resource, String>;
}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub resource: ResourceId,
    pub chunk_count: u32,
    pub align_chunks: u32,
    pub first_level: u32,
    pub last_level: u32,
}

#[derive(Debug, Clone)]
pub struct ChunkPacking {
    pub offsets: HashMap<ResourceId, u32>,
    pub rows_used: u32,
    pub occupancy: Vec<Vec<Option<ResourceId>>>,
}

pub fn pack_transient_resources(
    requests: &[AllocationRequest],
    level_count: u32,
    mode: AliasingMode,
) -> Result<ChunkPacking> {
    let levels = level_count.max(1) as usize;
    let capacity: u32 = requests
        .iter()
        .map(|request| request.chunk_count.max(1) + request.align_chunks.max(1))
        .sum();
    let mut grid: Vec<Vec<Option<ResourceId>>> = vec![vec![None; levels]; capacity as usize];
    let mut offsets = HashMap::new();
    let mut rows_used = 0u32;

    let mut order: Vec<&AllocationRequest> = requests.iter().collect();
    if mode == AliasingMode::Enabled {
        // Largest first; the sort is stable so ties keep registration order.
        order.sort_by(|a, b| b.chunk_count.cmp(&a.chunk_count));
    }

    let mut cursor = 0u32;
    for request in order {
        let chunks = request.chunk_count.max(1);
        let align = request.align_chunks.max(1);
        let first = request.first_level.min(level_count.saturating_sub(1)) as usize;
        let last = request.last_level.min(level_count.saturating_sub(1)) as usize;

        let offset = match mode {
            AliasingMode::Disabled => {
                let offset = cursor.next_multiple_of(align);
                cursor = offset + chunks;
                offset
            }
            AliasingMode::Enabled => {
                let mut found = None;
                let mut start = 0u32;
                while start + chunks <= capacity {
                    let fits = (start..start + chunks).all(|row| {
                        grid[row as usize][first..=last]
                            .iter()
                            .all(|cell| cell.is_none())
                    });
                    if fits {
                        found = Some(start);
                        break;
                    }
                    start += align;
                }
                found.ok_or(FrameGraphError::PlacementFailed {
                    resource: request.resource,
                    chunks,
                    rows: capacity,
                })?
            }
        };

        for row in offset..offset + chunks {
            for cell in grid[row as usize][first..=last].iter_mut() {
                *cell = Some(request.resource);
            }
        }
        offsets.insert(request.resource, offset);
        rows_used = rows_used.max(offset + chunks);
    }

    grid.truncate(rows_used as usize);
    Ok(ChunkPacking {
        offsets,
        rows_used,
        occupancy: grid,
    })
}

#[derive(Debug, Clone)]
pub struct PlacedResource {
    pub resource: ResourceId,
    pub heap_index: usize,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub initial_states: ResourceStates,
    pub discard_initial: bool,
    pub is_cube: bool,
    pub is_array: bool,
    pub has_stencil: bool,
}

#[derive(Debug, Clone)]
pub struct HeapInfo {
    pub category: HeapCategory,
    pub size_bytes: u64,
    pub chunk_rows: u32,
    pub occupancy: Vec<Vec<Option<ResourceId>>>,
}

pub struct FramePlan<D: RenderDevice> {
    pub level_count: u32,
    pub heaps: Vec<D::Heap>,
    pub heap_info: Vec<HeapInfo>,
    pub placements: HashMap<ResourceId, PlacedResource>,
    pub resources: HashMap<ResourceId, D::Resource>,
    pub barriers: Vec<LevelBarriers>,
}

impl<D: RenderDevice> std::fmt::Debug for FramePlan<D>
where
    D::Heap: std::fmt::Debug,
    D::Resource: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePlan")
            .field("level_count", &self.level_count)
            .field("heaps", &self.heaps)
            .field("heap_info", &self.heap_info)
            .field("placements", &self.placements)
            .field("resources", &self.resources)
            .field("barriers", &self.barriers)
            .finish()
    }
}

pub struct TextureBuilder<'a> {
    graph: &'a mut FrameGraph,
    name: String,
    desc: TextureDesc,
    flags: ResourceFlags,
    clear_value: Option<ClearValue>,
}

impl<'a> TextureBuilder<'a> {
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.desc.format = format;
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.desc.width = width;
        self.desc.height = height;
        self
    }

    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.desc.mip_level_count = levels;
        self
    }

    pub fn array_layers(mut self, layers: u32) -> Self {
        self.desc.depth_or_array_layers = layers;
        self
    }

    pub fn texture_3d(mut self, depth: u32) -> Self {
        self.desc.depth_or_array_layers = depth;
        self.flags.insert(ResourceFlags::TEXTURE_3D);
        self
    }

    pub fn cube_map(mut self) -> Self {
        self.desc.depth_or_array_layers = 6;
        self.flags.insert(ResourceFlags::CUBE_MAP);
        self
    }

    pub fn flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn depth_stencil(mut self) -> Self {
        self.flags.remove(ResourceFlags::RENDER_TARGET);
        self.flags.insert(ResourceFlags::DEPTH_STENCIL);
        self
    }

    pub fn unordered_access(mut self) -> Self {
        self.flags.insert(ResourceFlags::UNORDERED_ACCESS);
        self
    }

    pub fn temporal(mut self) -> Self {
        self.flags.insert(ResourceFlags::TEMPORAL);
        self
    }

    pub fn simultaneous_access(mut self) -> Self {
        self.flags.insert(ResourceFlags::SIMULTANEOUS_ACCESS);
        self
    }

    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_value = Some(ClearValue::Color(color));
        self
    }

    pub fn clear_depth_stencil(mut self, depth: f32, stencil: u8) -> Self {
        self.clear_value = Some(ClearValue::DepthStencil { depth, stencil });
        self
    }

    pub fn transient(self) -> ResourceId {
        self.graph.register(FrameResourceDescriptor {
            name: self.name,
            kind: ResourceKind::Texture(self.desc),
            flags: self.flags,
            clear_value: self.clear_value,
        })
    }
}

pub struct BufferBuilder<'a> {
    graph: &'a mut FrameGraph,
    name: String,
    desc: BufferDesc,
    flags: ResourceFlags,
}

impl<'a> BufferBuilder<'a> {
    pub fn size(mut self, size: u64) -> Self {
        self.desc.size = size;
        self
    }

    pub fn unordered_access(mut self) -> Self {
        self.flags.insert(ResourceFlags::UNORDERED_ACCESS);
        self
    }

    pub fn temporal(mut self) -> Self {
        self.flags.insert(ResourceFlags::TEMPORAL);
        self
    }

    pub fn transient(self) -> ResourceId {
        self.graph.register(FrameResourceDescriptor {
            name: self.name,
            kind: ResourceKind::Buffer(self.desc),
            flags: self.flags,
            clear_value: None,
        })
    }
}

pub struct PassBuilder<'a> {
    graph: &'a mut FrameGraph,
    name: String,
    accesses: Vec<PassAccess>,
}

impl<'a> PassBuilder<'a> {
    pub fn read(mut self, resource: ResourceId, states: ResourceStates) -> Self {
        self.accesses.push(PassAccess { resource, states });
        self
    }

    pub fn write(mut self, resource: ResourceId, states: ResourceStates) -> Self {
        self.accesses.push(PassAccess { resource, states });
        self
    }
}

impl<'a> Drop for PassBuilder<'a> {
    fn drop(&mut self) {
        self.graph.passes.push(PassNode {
            name: std::mem::take(&mut self.name),
            accesses: std::mem::take(&mut self.accesses),
        });
    }
}

pub struct FrameGraph {
    resources: Vec<FrameResourceDescriptor>,
    passes: Vec<PassNode>,
}

impl FrameGraph {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let backbuffer = FrameResourceDescriptor {
            name: "backbuffer".to_string(),
            kind: ResourceKind::Texture(TextureDesc {
                width,
                height,
                depth_or_array_layers: 1,
                mip_level_count: 1,
                format,
            }),
            flags: ResourceFlags::RENDER_TARGET,
            clear_value: None,
        };
        Self {
            resources: vec![backbuffer],
            passes: Vec::new(),
        }
    }

    pub fn add_texture(&mut self, name: &str) -> TextureBuilder<'_> {
        TextureBuilder {
            graph: self,
            name: name.to_string(),
            desc: TextureDesc {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
                mip_level_count: 1,
                format: PixelFormat::Rgba8UnormSrgb,
            },
            flags: ResourceFlags::RENDER_TARGET | ResourceFlags::SHADER_RESOURCE,
            clear_value: None,
        }
    }

    pub fn add_buffer(&mut self, name: &str) -> BufferBuilder<'_> {
        BufferBuilder {
            graph: self,
            name: name.to_string(),
            desc: BufferDesc { size: 256 },
            flags: ResourceFlags::SHADER_RESOURCE,
        }
    }

    pub fn pass(&mut self, name: &str) -> PassBuilder<'_> {
        PassBuilder {
            graph: self,
            name: name.to_string(),
            accesses: Vec::new(),
        }
    }

    pub fn descriptor(&self, id: ResourceId) -> Option<&FrameResourceDescriptor> {
        self.resources.get(id.0 as usize)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    fn register(&mut self, desc: FrameResourceDescriptor) -> ResourceId {
        let id = ResourceId::new(self.resources.len() as u32);
        self.resources.push(desc);
        id
    }

    pub fn compile<D: RenderDevice>(
        &self,
        device: &D,
        options: &CompileOptions,
    ) -> Result<FramePlan<D>> {
        self.validate_unique_names()?;

        let (pass_levels, level_count) = self.assign_dependency_levels()?;
        let usage = self.merge_level_states(&pass_levels)?;
        let timelines = self.build_timelines(&usage)?;
        let barriers = synthesize_barriers(&timelines, level_count)?;
        debug!(
            "compiled {} passes into {} dependency levels, {} barriers",
            self.passes.len(),
            level_count,
            barriers
                .iter()
                .map(|level| level.begin.len() + level.end.len())
                .sum::<usize>()
        );

        let chunk_size = options.chunk_size.max(1);
        let first_states: HashMap<ResourceId, ResourceStates> = timelines
            .iter()
            .filter_map(|timeline| {
                timeline
                    .entries
                    .first()
                    .map(|entry| (timeline.resource, entry.states))
            })
            .collect();
        let requests = self.build_requests(&timelines, level_count, device, chunk_size);

        let mut groups: Vec<(HeapCategory, Vec<AllocationRequest>)> = match device.heap_tier() {
            ResourceHeapTier::Tier1 => {
                let (rtds, generic): (Vec<_>, Vec<_>) = requests.into_iter().partition(|req| {
                    self.resources[req.resource.0 as usize].flags.heap_category()
                        == HeapCategory::RtDs
                });
                vec![
                    (HeapCategory::RtDs, rtds),
                    (HeapCategory::Generic, generic),
                ]
            }
            ResourceHeapTier::Tier2 => vec![(HeapCategory::Mixed, requests)],
        };
        groups.retain(|(_, requests)| !requests.is_empty());

        // All offsets must be final before any heap or resource exists;
        // placement is heap-relative.
        let mut packed = Vec::new();
        for (category, requests) in groups {
            let packing = pack_transient_resources(&requests, level_count, options.aliasing)?;
            packed.push((category, requests, packing));
        }

        let mut heaps = Vec::new();
        let mut heap_info = Vec::new();
        let mut placements = HashMap::new();
        let mut created = HashMap::new();
        for (category, requests, packing) in packed {
            let heap_bytes = u64::from(packing.rows_used) * chunk_size;
            let heap = device.create_heap(category, heap_bytes).map_err(|reason| {
                FrameGraphError::DeviceCreation {
                    what: "heap",
                    name: format!("{category:?}"),
                    reason,
                }
            })?;
            debug!("heap {:?}: {} KiB", category, heap_bytes / 1024);
            let heap_index = heaps.len();
            for request in &requests {
                let desc = &self.resources[request.resource.0 as usize];
                let offset_bytes = u64::from(packing.offsets[&request.resource]) * chunk_size;
                let initial_states = first_states[&request.resource];
                let resource = device
                    .create_placed_resource(&heap, offset_bytes, desc, initial_states)
                    .map_err(|reason| FrameGraphError::DeviceCreation {
                        what: "placed resource",
                        name: desc.name.clone(),
                        reason,
                    })?;
                let (is_array, has_stencil) = match &desc.kind {
                    ResourceKind::Texture(texture) => (
                        !desc.flags.contains(ResourceFlags::TEXTURE_3D)
                            && texture.depth_or_array_layers > 1,
                        texture.format.has_stencil(),
                    ),
                    ResourceKind::Buffer(_) => (false, false),
                };
                placements.insert(
                    request.resource,
                    PlacedResource {
                        resource: request.resource,
                        heap_index,
                        offset_bytes,
                        size_bytes: desc.size_bytes(),
                        chunk_count: request.chunk_count,
                        initial_states,
                        discard_initial: !desc.flags.contains(ResourceFlags::TEMPORAL),
                        is_cube: desc.flags.contains(ResourceFlags::CUBE_MAP),
                        is_array,
                        has_stencil,
                    },
                );
                created.insert(request.resource, resource);
            }
            heap_info.push(HeapInfo {
                category,
                size_bytes: heap_bytes,
                chunk_rows: packing.rows_used,
                occupancy: packing.occupancy,
            });
            heaps.push(heap);
        }

        Ok(FramePlan {
            level_count,
            heaps,
            heap_info,
            placements,
            resources: created,
            barriers,
        })
    }

    fn validate_unique_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for desc in &self.resources {
            if !seen.insert(desc.name.as_str()) {
                return Err(FrameGraphError::DuplicateResourceName {
                    name: desc.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn assign_dependency_levels(&self) -> Result<(Vec<u32>, u32)> {
        let mut graph: DiGraph<usize, ResourceId> = DiGraph::new();
        let nodes: Vec<_> = (0..self.passes.len())
            .map(|index| graph.add_node(index))
            .collect();

        let mut last_writer = HashMap::new();
        for (index, pass) in self.passes.iter().enumerate() {
            let node = nodes[index];
            for access in &pass.accesses {
                if !access.states.has_write()
                    && let Some(&writer) = last_writer.get(&access.resource)
                    && !graph.contains_edge(writer, node)
                {
                    graph.add_edge(writer, node, access.resource);
                }
            }
            for access in &pass.accesses {
                if access.states.has_write() {
                    if let Some(&writer) = last_writer.get(&access.resource)
                        && writer != node
                        && !graph.contains_edge(writer, node)
                    {
                        graph.add_edge(writer, node, access.resource);
                    }
                    last_writer.insert(access.resource, node);
                }
            }
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|_| FrameGraphError::CyclicDependency)?;

        let mut levels = vec![0u32; self.passes.len()];
        for node in order {
            let level = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|pred| levels[graph[pred]] + 1)
                .max()
                .unwrap_or(0);
            levels[graph[node]] = level;
        }
        let level_count = levels.iter().max().map(|max| max + 1).unwrap_or(1);
        Ok((levels, level_count))
    }

    fn merge_level_states(
        &self,
        pass_levels: &[u32],
    ) -> Result<HashMap<ResourceId, BTreeMap<u32, ResourceStates>>> {
        let mut usage: HashMap<ResourceId, BTreeMap<u32, ResourceStates>> = HashMap::new();
        for (pass, &level) in self.passes.iter().zip(pass_levels) {
            for access in &pass.accesses {
                let desc = self.resources.get(access.resource.0 as usize).ok_or_else(|| {
                    FrameGraphError::ResourceNotFound {
                        pass: pass.name.clone(),
                        id: access.resource,
                    }
                })?;
                if !desc.flags.supports(access.states) {
                    return Err(FrameGraphError::UnsupportedState {
                        pass: pass.name.clone(),
                        resource: desc.name.clone(),
                        states: access.states,
                        flags: desc.flags,
                    });
                }
                let entry = usage
                    .entry(access.resource)
                    .or_default()
                    .entry(level)
                    .or_insert(ResourceStates::empty());
                *entry |= access.states;
            }
        }

        for (&id, levels) in &usage {
            for (&level, &states) in levels {
                // Write states are exclusive; any combination involving one
                // is a hazard the graph author has to resolve.
                if states.has_write() && states.bits().count_ones() > 1 {
                    return Err(FrameGraphError::ConflictingStates {
                        resource: self.resources[id.0 as usize].name.clone(),
                        states,
                        level,
                    });
                }
            }
        }
        Ok(usage)
    }

    fn build_timelines(
        &self,
        usage: &HashMap<ResourceId, BTreeMap<u32, ResourceStates>>,
    ) -> Result<Vec<ResourceTimeline>> {
        let mut timelines = Vec::with_capacity(self.resources.len());
        for (index, desc) in self.resources.iter().enumerate() {
            let id = ResourceId::new(index as u32);
            let mut timeline = ResourceTimeline::new(id);
            match usage.get(&id) {
                Some(levels) => {
                    for (&level, &states) in levels {
                        timeline.push(level, states);
                    }
                }
                None if id == BACKBUFFER => {
                    timeline.push(0, ResourceStates::PRESENT);
                }
                None => {
                    return Err(FrameGraphError::ResourceNeverReferenced {
                        resource: desc.name.clone(),
                    });
                }
            }
            timelines.push(timeline);
        }
        Ok(timelines)
    }

    fn build_requests<D: RenderDevice>(
        &self,
        timelines: &[ResourceTimeline],
        level_count: u32,
        device: &D,
        chunk_size: u64,
    ) -> Vec<AllocationRequest> {
        timelines
            .iter()
            .filter(|timeline| timeline.resource != BACKBUFFER)
            .map(|timeline| {
                let desc = &self.resources[timeline.resource.0 as usize];
                let alignment = device.placement_alignment(desc).max(1);
                let footprint = desc.size_bytes().div_ceil(alignment) * alignment;
                let (first_level, last_level) = if desc.flags.contains(ResourceFlags::TEMPORAL) {
                    (0, level_count.saturating_sub(1))
                } else {
                    (timeline.first_level(), timeline.last_level())
                };
                AllocationRequest {
                    resource: timeline.resource,
                    chunk_count: footprint.div_ceil(chunk_size).max(1) as u32,
                    align_chunks: alignment.div_ceil(chunk_size).max(1) as u32,
                    first_level,
                    last_level,
                }
            })
            .collect()
    }
}

fn synthesize_barriers(
    timelines: &[ResourceTimeline],
    level_count: u32,
) -> Result<Vec<LevelBarriers>> {
    let mut schedule: Vec<LevelBarriers> = (0..level_count.max(1))
        .map(|_| LevelBarriers::default())
        .collect();

    for timeline in timelines {
        let entries = &timeline.entries;
        if entries.is_empty() {
            continue;
        }

        if timeline.resource == BACKBUFFER {
            // The swapchain image starts every frame in PRESENT. If its first
            // use is late, the transition overlaps earlier unrelated levels.
            let first = entries[0];
            if first.states != ResourceStates::PRESENT {
                if first.level == 0 {
                    schedule[0].begin.push(BarrierEntry {
                        resource: timeline.resource,
                        kind: BarrierKind::Immediate,
                        before: ResourceStates::PRESENT,
                        after: first.states,
                    });
                } else {
                    schedule[0].begin.push(BarrierEntry {
                        resource: timeline.resource,
                        kind: BarrierKind::SplitBegin,
                        before: ResourceStates::PRESENT,
                        after: first.states,
                    });
                    schedule[first.level as usize].begin.push(BarrierEntry {
                        resource: timeline.resource,
                        kind: BarrierKind::SplitEnd,
                        before: ResourceStates::PRESENT,
                        after: first.states,
                    });
                }
            }
        }

        for pair in entries.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if to.level - from.level > 1 {
                schedule[from.level as usize].end.push(BarrierEntry {
                    resource: timeline.resource,
                    kind: BarrierKind::SplitBegin,
                    before: from.states,
                    after: to.states,
                });
                schedule[to.level as usize].begin.push(BarrierEntry {
                    resource: timeline.resource,
                    kind: BarrierKind::SplitEnd,
                    before: from.states,
                    after: to.states,
                });
            } else {
                schedule[to.level as usize].begin.push(BarrierEntry {
                    resource: timeline.resource,
                    kind: BarrierKind::Immediate,
                    before: from.states,
                    after: to.states,
                });
            }
        }

        if timeline.resource == BACKBUFFER {
            let last = entries[entries.len() - 1];
            if last.states != ResourceStates::PRESENT {
                schedule[level_count.saturating_sub(1) as usize]
                    .end
                    .push(BarrierEntry {
                        resource: timeline.resource,
                        kind: BarrierKind::Immediate,
                        before: last.states,
                        after: ResourceStates::PRESENT,
                    });
            }
        }
    }

    validate_barrier_schedule(&schedule)?;
    Ok(schedule)
}

pub fn validate_barrier_schedule(schedule: &[LevelBarriers]) -> Result<()> {
    let mut open: HashMap<ResourceId, BarrierEntry> = HashMap::new();
    for (level, barriers) in schedule.iter().enumerate() {
        let level = level as u32;
        for entry in barriers.begin.iter().chain(barriers.end.iter()) {
            match entry.kind {
                BarrierKind::SplitBegin => {
                    if open.insert(entry.resource, *entry).is_some() {
                        return Err(FrameGraphError::UnmatchedSplitBarrier {
                            resource: entry.resource,
                            level,
                        });
                    }
                }
                BarrierKind::SplitEnd => {
                    let begin = open.remove(&entry.resource).ok_or(
                        FrameGraphError::UnmatchedSplitBarrier {
                            resource: entry.resource,
                            level,
                        },
                    )?;
                    if begin.before != entry.before || begin.after != entry.after {
                        return Err(FrameGraphError::UnmatchedSplitBarrier {
                            resource: entry.resource,
                            level,
                        });
                    }
                }
                BarrierKind::Immediate => {
                    if open.contains_key(&entry.resource) {
                        return Err(FrameGraphError::UnmatchedSplitBarrier {
                            resource: entry.resource,
                            level,
                        });
                    }
                }
            }
        }
    }
    if let Some(&resource) = open.keys().next() {
        return Err(FrameGraphError::UnmatchedSplitBarrier {
            resource,
            level: schedule.len().saturating_sub(1) as u32,
        });
    }
    Ok(())
}

struct PassNode {
    name: String,
    accesses: Vec<PassAccess>,
}

struct PassAccess {
    resource: ResourceId,
    states: ResourceStates,
}
