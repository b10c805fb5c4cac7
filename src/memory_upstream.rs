use super::*;

#[derive(Debug)]
struct State<T, B> {
    template: T,
    fail_templates: bool,
    accept_blocks: bool,
    template_requests: usize,
    blocks: Vec<B>,
}

/// Upstream backed by a template held in memory. Blocks handed to it are
/// recorded and accepted or rejected on command.
pub struct MemoryUpstream<F: Family> {
    state: Mutex<State<F::Template, F::Block>>,
}

impl<F: Family> MemoryUpstream<F>
where
    F::Template: Clone,
    F::Block: Clone,
{
    pub fn new(template: F::Template) -> Self {
        Self {
            state: Mutex::new(State {
                template,
                fail_templates: false,
                accept_blocks: true,
                template_requests: 0,
                blocks: Vec::new(),
            }),
        }
    }

    pub fn set_template(&self, template: F::Template) {
        self.state.lock().template = template;
    }

    pub fn fail_templates(&self, fail: bool) {
        self.state.lock().fail_templates = fail;
    }

    pub fn accept_blocks(&self, accept: bool) {
        self.state.lock().accept_blocks = accept;
    }

    pub fn template_requests(&self) -> usize {
        self.state.lock().template_requests
    }

    pub fn submitted_blocks(&self) -> Vec<F::Block> {
        self.state.lock().blocks.clone()
    }
}

#[async_trait]
impl<F: Family> Upstream<F> for MemoryUpstream<F>
where
    F::Template: Clone,
    F::Block: Clone,
{
    async fn block_template(&self) -> Result<F::Template> {
        let mut state = self.state.lock();

        state.template_requests += 1;

        ensure!(!state.fail_templates, "template source unavailable");

        Ok(state.template.clone())
    }

    async fn submit_block(&self, _share: &Share, block: &F::Block) -> Result<SubmitResult> {
        let mut state = self.state.lock();

        state.blocks.push(block.clone());

        Ok(if state.accept_blocks {
            SubmitResult::accepted(Some("confirmed".into()))
        } else {
            SubmitResult::rejected()
        })
    }
}
