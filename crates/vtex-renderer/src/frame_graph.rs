//! Frame Graph (Render Graph)
//!
//! Pass list with declared resource reads and writes, compiled once and executed in order
//! against a `Device`.

use ahash::AHashMap;
use smallvec::SmallVec;
use vtex_core::{TextureId, UploadReservation};

use crate::device::{Device, ReadbackHandle};
use crate::{RendererError, RendererResult};

/// Unique identifier for a render resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u32);

/// Unique identifier for a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(u32);

/// Render resource descriptor
#[derive(Debug, Clone)]
pub struct RenderResource {
    /// Resource ID
    pub id: ResourceId,
    /// Resource name (for debugging)
    pub name: String,
    /// Resource type
    pub resource_type: ResourceType,
    /// Size (for textures)
    pub size: Option<(u32, u32)>,
    /// Format (for textures)
    pub format: Option<RenderFormat>,
    /// Whether the graph owns the resource for this frame only
    pub transient: bool,
}

/// Resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// Depth texture
    DepthTexture,
    /// GPU buffer
    Buffer,
    /// Host-readable buffer owned outside the graph
    Readback(ReadbackHandle),
}

/// Render target formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Depth32F,
}

/// Queue types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

/// Compute kernels of the feedback compaction pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeKernel {
    /// Per-group sort and dedup of raw feedback records
    CompressFeedback,
    /// Write each group's compressed record count
    SetBlockSizes,
    /// Exclusive prefix sum of group sizes
    PrefixSumBlocks,
    /// Scatter compressed groups to their offsets
    MergeBlocks,
}

/// One feedback draw call
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCommand {
    /// Caller-side identifier of the draw
    pub draw_id: u32,
    /// Streamed textures the draw samples
    pub textures: SmallVec<[TextureId; 4]>,
    /// Per-draw constants
    pub constants: UploadReservation,
    /// Skinned vertices for animated draws
    pub vertices: Option<UploadReservation>,
}

/// Commands a pass records
#[derive(Debug, Clone, PartialEq)]
pub enum PassCommand {
    /// Clear the feedback depth target and record buffer
    ClearFeedback { max_records: u32 },
    /// Write the first GPU timestamp
    BeginTimestamp,
    /// Write the second GPU timestamp
    EndTimestamp,
    /// Draw geometry writing tile feedback
    Draw(DrawCommand),
    /// Dispatch a compute kernel
    Dispatch { kernel: ComputeKernel, groups: [u32; 3] },
    /// Copy header, timestamps and compacted records into a readback buffer
    CopyToReadback { readback: ReadbackHandle, max_records: u32 },
    /// Queue the readback buffer for host access
    QueueReadback { readback: ReadbackHandle },
}

/// Render pass definition
#[derive(Debug, Clone)]
pub struct RenderPass {
    /// Pass ID
    pub id: PassId,
    /// Pass name
    pub name: String,
    /// Resources read by this pass
    pub reads: SmallVec<[ResourceId; 8]>,
    /// Resources written by this pass
    pub writes: SmallVec<[ResourceId; 4]>,
    /// Pass queue type
    pub queue: QueueType,
    /// Recorded commands
    pub commands: Vec<PassCommand>,
}

impl RenderPass {
    /// Create a new render pass
    pub fn new(id: PassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            queue: QueueType::Graphics,
            commands: Vec::new(),
        }
    }
}

/// Resource lifetime tracking
#[derive(Debug, Clone, Copy)]
struct ResourceLifetime {
    first_use: usize,
    last_use: usize,
}

/// Frame graph for pass scheduling
pub struct FrameGraph {
    /// All resources
    resources: AHashMap<ResourceId, RenderResource>,
    /// All passes in submission order
    passes: Vec<RenderPass>,
    /// Pass execution order (after compilation)
    execution_order: Vec<PassId>,
    /// Resource lifetimes by pass position
    lifetimes: AHashMap<ResourceId, ResourceLifetime>,
    /// Next resource ID
    next_resource_id: u32,
    /// Next pass ID
    next_pass_id: u32,
    /// Whether the graph has been compiled
    compiled: bool,
}

impl FrameGraph {
    /// Create a new frame graph
    pub fn new() -> Self {
        Self {
            resources: AHashMap::new(),
            passes: Vec::new(),
            execution_order: Vec::new(),
            lifetimes: AHashMap::new(),
            next_resource_id: 0,
            next_pass_id: 0,
            compiled: false,
        }
    }

    fn add_resource(
        &mut self,
        name: String,
        resource_type: ResourceType,
        size: Option<(u32, u32)>,
        format: Option<RenderFormat>,
        transient: bool,
    ) -> ResourceId {
        let id = ResourceId(self.next_resource_id);
        self.next_resource_id += 1;

        self.resources.insert(
            id,
            RenderResource {
                id,
                name,
                resource_type,
                size,
                format,
                transient,
            },
        );
        self.compiled = false;
        id
    }

    /// Create a transient depth target
    pub fn create_depth_target(&mut self, name: impl Into<String>, width: u32, height: u32) -> ResourceId {
        self.add_resource(
            name.into(),
            ResourceType::DepthTexture,
            Some((width, height)),
            Some(RenderFormat::Depth32F),
            true,
        )
    }

    /// Create a transient buffer
    pub fn create_buffer(&mut self, name: impl Into<String>) -> ResourceId {
        self.add_resource(name.into(), ResourceType::Buffer, None, None, true)
    }

    /// Import a readback buffer owned outside the graph
    pub fn import_readback(&mut self, name: impl Into<String>, readback: ReadbackHandle) -> ResourceId {
        self.add_resource(name.into(), ResourceType::Readback(readback), None, None, false)
    }

    /// Add a render pass
    pub fn add_pass(&mut self, name: impl Into<String>) -> PassBuilder<'_> {
        let id = PassId(self.next_pass_id);
        self.next_pass_id += 1;
        self.compiled = false;

        PassBuilder {
            graph: self,
            pass: RenderPass::new(id, name),
        }
    }

    /// Compile the frame graph
    ///
    /// Fails if a pass reads a transient resource no earlier pass wrote.
    pub fn compile(&mut self) -> RendererResult<()> {
        if self.compiled {
            return Ok(());
        }

        self.calculate_lifetimes();
        self.validate_reads()?;
        self.execution_order = self.passes.iter().map(|p| p.id).collect();

        self.compiled = true;
        Ok(())
    }

    fn calculate_lifetimes(&mut self) {
        self.lifetimes.clear();

        for (position, pass) in self.passes.iter().enumerate() {
            for &resource_id in pass.reads.iter().chain(pass.writes.iter()) {
                self.lifetimes
                    .entry(resource_id)
                    .and_modify(|lifetime| lifetime.last_use = position)
                    .or_insert(ResourceLifetime {
                        first_use: position,
                        last_use: position,
                    });
            }
        }
    }

    fn validate_reads(&self) -> RendererResult<()> {
        let mut written = ahash::AHashSet::new();

        for pass in &self.passes {
            for resource_id in &pass.reads {
                let resource = self.resources.get(resource_id).ok_or_else(|| {
                    RendererError::ResourceNotFound(format!("{resource_id:?} in {}", pass.name))
                })?;
                if resource.transient && !written.contains(resource_id) {
                    return Err(RendererError::InvalidGraph(format!(
                        "pass '{}' reads '{}' before it is written",
                        pass.name, resource.name
                    )));
                }
            }
            written.extend(pass.writes.iter().copied());
        }
        Ok(())
    }

    /// Compile if needed and record every pass on the device in order
    pub fn execute(&mut self, device: &dyn Device) -> RendererResult<()> {
        self.compile()?;

        for id in &self.execution_order {
            if let Some(pass) = self.passes.iter().find(|p| p.id == *id) {
                device.record_pass(&pass.name, pass.queue, &pass.commands);
            }
        }
        Ok(())
    }

    /// Get the execution order
    pub fn execution_order(&self) -> &[PassId] {
        &self.execution_order
    }

    /// Get a pass by ID
    pub fn get_pass(&self, id: PassId) -> Option<&RenderPass> {
        self.passes.iter().find(|p| p.id == id)
    }

    /// Get a resource by ID
    pub fn get_resource(&self, id: ResourceId) -> Option<&RenderResource> {
        self.resources.get(&id)
    }

    /// First and last pass position using a resource
    pub fn resource_lifetime(&self, id: ResourceId) -> Option<(usize, usize)> {
        self.lifetimes.get(&id).map(|l| (l.first_use, l.last_use))
    }

    /// Clear the frame graph for reuse
    pub fn clear(&mut self) {
        self.resources.clear();
        self.passes.clear();
        self.execution_order.clear();
        self.lifetimes.clear();
        self.next_resource_id = 0;
        self.next_pass_id = 0;
        self.compiled = false;
    }

    /// Get the number of passes
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Get the number of resources
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for constructing render passes
pub struct PassBuilder<'a> {
    graph: &'a mut FrameGraph,
    pass: RenderPass,
}

impl<'a> PassBuilder<'a> {
    /// Add a read dependency
    pub fn read(mut self, resource: ResourceId) -> Self {
        self.pass.reads.push(resource);
        self
    }

    /// Add a write output
    pub fn write(mut self, resource: ResourceId) -> Self {
        self.pass.writes.push(resource);
        self
    }

    /// Set the queue type
    pub fn on_queue(mut self, queue: QueueType) -> Self {
        self.pass.queue = queue;
        self
    }

    /// Append a command
    pub fn command(mut self, command: PassCommand) -> Self {
        self.pass.commands.push(command);
        self
    }

    /// Append several commands
    pub fn commands(mut self, commands: impl IntoIterator<Item = PassCommand>) -> Self {
        self.pass.commands.extend(commands);
        self
    }

    /// Build and add the pass to the graph
    pub fn build(self) -> PassId {
        let id = self.pass.id;
        self.graph.passes.push(self.pass);
        id
    }
}
