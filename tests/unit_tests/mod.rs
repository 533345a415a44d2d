mod prolongation;

/// Runs `f` once per input on its own thread, as one rank of a local cluster, and returns
/// the results in rank order.
pub fn run_on_ranks<I, R, F>(inputs: Vec<I>, f: F) -> Vec<R>
where
    I: Send,
    R: Send,
    F: Fn(I) -> R + Sync,
{
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = inputs
            .into_iter()
            .map(|input| scope.spawn(move || f(input)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("A rank panicked"))
            .collect()
    })
}
